//! Log store adapter tests
//!
//! Exercises the LogStore contract against a real SQLite file: sequence
//! allocation, delta-count maintenance, retention-aware pruning, session
//! rows, and compaction job scheduling guards.

use driftsync::log_store::{CompactionRow, JobStatus, LogStore, SessionRow, SnapshotRow};
use driftsync::types::Timestamp;
use driftsync_log_adapter_sqlite::LogAdapterSqlite;
use tempfile::TempDir;

async fn create_test_adapter() -> (LogAdapterSqlite, TempDir) {
	let temp_dir = TempDir::new().expect("Failed to create temp directory");
	let adapter = LogAdapterSqlite::new(temp_dir.path()).await.expect("Failed to create adapter");
	(adapter, temp_dir)
}

fn blob(n: u8) -> Vec<u8> {
	vec![n, n, n, n]
}

#[tokio::test]
async fn seq_allocation_is_monotonic_per_collection() {
	let (store, _temp) = create_test_adapter().await;

	for i in 1..=5u8 {
		let res = store.append_delta("tasks", "a", &blob(i), true).await.unwrap();
		assert_eq!(res.seq, u64::from(i));
	}
	// A second collection has its own counter
	let res = store.append_delta("notes", "x", &blob(1), true).await.unwrap();
	assert_eq!(res.seq, 1);
	assert_eq!(store.current_seq("tasks").await.unwrap(), 5);
	assert_eq!(store.current_seq("notes").await.unwrap(), 1);
}

#[tokio::test]
async fn delta_counts_track_inserts_and_prunes() {
	let (store, _temp) = create_test_adapter().await;

	for i in 1..=6u8 {
		store.append_delta("tasks", "a", &blob(i), true).await.unwrap();
	}
	store.append_delta("tasks", "b", &blob(9), true).await.unwrap();
	assert_eq!(store.delta_count("tasks", "a").await.unwrap(), 6);
	assert_eq!(store.delta_count("tasks", "b").await.unwrap(), 1);

	// Keep the two highest-seq deltas of the six
	let deleted = store.prune_deltas("tasks", "a", 6, 2).await.unwrap();
	assert_eq!(deleted, 4);
	assert_eq!(store.delta_count("tasks", "a").await.unwrap(), 2);

	let rows = store.document_deltas("tasks", "a", 0, None, 100).await.unwrap();
	let seqs: Vec<u64> = rows.iter().map(|r| r.seq).collect();
	assert_eq!(seqs, vec![5, 6]);
	// Other documents untouched
	assert_eq!(store.delta_count("tasks", "b").await.unwrap(), 1);
}

#[tokio::test]
async fn deltas_after_pages_in_seq_order() {
	let (store, _temp) = create_test_adapter().await;
	for i in 1..=10u8 {
		let doc = if i % 2 == 0 { "a" } else { "b" };
		store.append_delta("tasks", doc, &blob(i), true).await.unwrap();
	}

	let page = store.deltas_after("tasks", 3, 4).await.unwrap();
	let seqs: Vec<u64> = page.iter().map(|r| r.seq).collect();
	assert_eq!(seqs, vec![4, 5, 6, 7]);
	assert_eq!(store.oldest_seq("tasks").await.unwrap(), Some(1));
	assert_eq!(store.oldest_seq("empty").await.unwrap(), None);
}

#[tokio::test]
async fn tombstone_flag_round_trips() {
	let (store, _temp) = create_test_adapter().await;
	store.append_delta("tasks", "a", &blob(1), true).await.unwrap();
	store.append_delta("tasks", "a", &blob(2), false).await.unwrap();

	let rows = store.document_deltas("tasks", "a", 0, None, 10).await.unwrap();
	assert!(rows[0].exists);
	assert!(!rows[1].exists);
}

#[tokio::test]
async fn snapshot_upsert_is_unique_per_document() {
	let (store, _temp) = create_test_adapter().await;
	let row = SnapshotRow {
		collection: "tasks".into(),
		document: "a".into(),
		bytes: blob(1),
		vector: blob(2),
		seq: 10,
		created: Timestamp::now(),
	};
	store.upsert_snapshot(&row).await.unwrap();
	let replaced = SnapshotRow { bytes: blob(7), seq: 20, ..row };
	store.upsert_snapshot(&replaced).await.unwrap();

	let snaps = store.snapshots("tasks").await.unwrap();
	assert_eq!(snaps.len(), 1);
	assert_eq!(snaps[0].seq, 20);
	assert_eq!(snaps[0].bytes, blob(7));
}

#[tokio::test]
async fn session_mark_never_regresses_seq() {
	let (store, _temp) = create_test_adapter().await;
	let row = SessionRow {
		collection: "tasks".into(),
		document: "a".into(),
		client: "c1".into(),
		connected: true,
		seq: 0,
		seen: Timestamp(100),
		vector: None,
		user: Some("alice".into()),
		profile: None,
		cursor: None,
		deadline: Some(Timestamp(200)),
	};
	store.upsert_session(&row).await.unwrap();

	store.mark_session("tasks", "a", "c1", Some(5), Some(blob(3)), Timestamp(110)).await.unwrap();
	store.mark_session("tasks", "a", "c1", Some(3), None, Timestamp(120)).await.unwrap();

	let session = store.session("tasks", "a", "c1").await.unwrap().unwrap();
	assert_eq!(session.seq, 5, "an out-of-order mark must not rewind seq");
	assert_eq!(session.seen, Timestamp(120));
	assert_eq!(session.vector, Some(blob(3)));
	assert_eq!(session.user.as_deref(), Some("alice"));
}

#[tokio::test]
async fn disconnect_clears_cursor_and_deadline() {
	let (store, _temp) = create_test_adapter().await;
	let row = SessionRow {
		collection: "tasks".into(),
		document: "a".into(),
		client: "c1".into(),
		connected: true,
		seq: 1,
		seen: Timestamp(100),
		vector: None,
		user: None,
		profile: None,
		cursor: Some(serde_json::json!({"anchor": 4})),
		deadline: Some(Timestamp(200)),
	};
	store.upsert_session(&row).await.unwrap();
	store.set_disconnected("tasks", "a", "c1").await.unwrap();

	let session = store.session("tasks", "a", "c1").await.unwrap().unwrap();
	assert!(!session.connected);
	assert!(session.cursor.is_none());
	assert!(session.deadline.is_none());
	assert_eq!(session.seq, 1, "sync progress survives disconnect");
}

#[tokio::test]
async fn stale_session_gc_only_touches_disconnected_rows() {
	let (store, _temp) = create_test_adapter().await;
	for (client, connected, seen) in [("old", false, 10), ("live", true, 10), ("fresh", false, 900)] {
		store
			.upsert_session(&SessionRow {
				collection: "tasks".into(),
				document: "a".into(),
				client: client.into(),
				connected,
				seq: 0,
				seen: Timestamp(seen),
				vector: None,
				user: None,
				profile: None,
				cursor: None,
				deadline: None,
			})
			.await
			.unwrap();
	}

	let deleted = store.delete_stale_sessions("tasks", "a", Timestamp(500)).await.unwrap();
	assert_eq!(deleted, 1);
	let remaining: Vec<_> = store
		.sessions("tasks", "a")
		.await
		.unwrap()
		.into_iter()
		.map(|s| s.client)
		.collect();
	assert!(remaining.iter().any(|c| c.as_ref() == "live"));
	assert!(remaining.iter().any(|c| c.as_ref() == "fresh"));
}

#[tokio::test]
async fn job_scheduling_guards_against_duplicates() {
	let (store, _temp) = create_test_adapter().await;
	let job = CompactionRow::pending("tasks", "a", 3600, 0);

	assert!(store.try_schedule_job(&job).await.unwrap());
	assert!(!store.try_schedule_job(&job).await.unwrap(), "pending job blocks rescheduling");

	let mut running = store.job("tasks", "a").await.unwrap().unwrap();
	running.status = JobStatus::Running;
	store.update_job(&running).await.unwrap();
	assert!(!store.try_schedule_job(&job).await.unwrap(), "running job blocks rescheduling");

	running.status = JobStatus::Done;
	store.update_job(&running).await.unwrap();
	assert!(store.try_schedule_job(&job).await.unwrap(), "finished job can be replaced");
}

#[tokio::test]
async fn job_state_round_trips_scratch_and_cursor() {
	let (store, _temp) = create_test_adapter().await;
	let mut job = CompactionRow::pending("tasks", "a", 3600, 2);
	assert!(store.try_schedule_job(&job).await.unwrap());

	job.status = JobStatus::Running;
	job.boundary_seq = Some(42);
	job.cursor = Some(17);
	job.scratch = Some(blob(5));
	job.processed = 17;
	store.update_job(&job).await.unwrap();

	let loaded = store.job("tasks", "a").await.unwrap().unwrap();
	assert_eq!(loaded.status, JobStatus::Running);
	assert_eq!(loaded.boundary_seq, Some(42));
	assert_eq!(loaded.cursor, Some(17));
	assert_eq!(loaded.scratch, Some(blob(5)));
	assert_eq!(loaded.processed, 17);
	assert_eq!(loaded.retain, 2);
}

// vim: ts=4
