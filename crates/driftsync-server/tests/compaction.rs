//! Compaction engine tests
//!
//! Covers snapshot absorption, the peer-safety constraint, retention, the
//! at-most-one-job guard, and the boundary fence against concurrent writes.

mod common;

use common::{engine, engine_with, text_of, vector_after, TextSource};

use driftsync_types::api::{PresenceAction, PresenceUpdate, SyncApi, WriteHints};
use driftsync_types::log_store::{JobPhase, JobStatus};
use driftsync_types::types::CollectionConfig;

async fn write_n(
	engine: &driftsync_server::Engine,
	source: &TextSource,
	document: &str,
	n: usize,
) -> Vec<Vec<u8>> {
	let mut deltas = Vec::new();
	for i in 0..n {
		let delta = source.edit(&format!("{} ", i));
		deltas.push(delta.clone());
		engine.update_document("tasks", document, &delta, WriteHints::default()).await.unwrap();
	}
	deltas
}

#[tokio::test]
async fn snapshot_alone_reproduces_the_full_delta_stream() {
	let _ = tracing_subscriber::fmt().try_init();
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	let deltas = write_n(&engine, &source, "a", 10).await;

	engine.compact("tasks", "a").await.unwrap();

	let job = engine.compaction_status("tasks", "a").await.unwrap().unwrap();
	assert_eq!(job.status, JobStatus::Done);
	assert_eq!(job.phase, JobPhase::Finalize);
	assert_eq!(job.boundary_seq, Some(10));

	let snapshot = engine.log().snapshot("tasks", "a").await.unwrap().unwrap();
	assert_eq!(snapshot.seq, 10);
	// Applying the snapshot alone equals replaying the full history
	assert_eq!(text_of(&[snapshot.bytes.clone()]), text_of(&deltas));

	// No active sessions, retain 0: the whole chain is pruned
	let store = engine.log().store();
	assert_eq!(store.delta_count("tasks", "a").await.unwrap(), 0);
	assert_eq!(store.oldest_seq("tasks").await.unwrap(), None);
}

#[tokio::test]
async fn lagging_peer_blocks_delta_deletion() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	let deltas = write_n(&engine, &source, "a", 10).await;

	// S1 caught up through seq 3, S2 through seq 2, both connected
	for (client, upto) in [("s1", 3usize), ("s2", 2usize)] {
		engine
			.presence(
				"tasks",
				"a",
				client,
				PresenceAction::Join,
				PresenceUpdate {
					vector: Some(vector_after(&deltas[..upto])),
					..PresenceUpdate::default()
				},
			)
			.await
			.unwrap();
	}

	engine.compact("tasks", "a").await.unwrap();

	// All ten deltas remain plus a snapshot at the boundary
	let store = engine.log().store();
	assert_eq!(store.delta_count("tasks", "a").await.unwrap(), 10);
	let snapshot = engine.log().snapshot("tasks", "a").await.unwrap().unwrap();
	assert_eq!(snapshot.seq, 10);

	// A third client replaying from cursor 0 still reconstructs everything
	let batch = engine.stream("tasks", 0, None).await.unwrap();
	let blobs: Vec<Vec<u8>> = batch.changes.into_iter().map(|c| c.bytes).collect();
	assert_eq!(text_of(&blobs), source.text());
}

#[tokio::test]
async fn caught_up_peers_allow_pruning() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	let deltas = write_n(&engine, &source, "a", 10).await;

	engine
		.presence(
			"tasks",
			"a",
			"s1",
			PresenceAction::Join,
			PresenceUpdate { vector: Some(vector_after(&deltas)), ..PresenceUpdate::default() },
		)
		.await
		.unwrap();

	engine.compact("tasks", "a").await.unwrap();

	let store = engine.log().store();
	assert_eq!(store.delta_count("tasks", "a").await.unwrap(), 0);
	let snapshot = engine.log().snapshot("tasks", "a").await.unwrap().unwrap();
	assert_eq!(text_of(&[snapshot.bytes]), source.text());
}

#[tokio::test]
async fn retain_keeps_the_highest_seq_deltas() {
	let config = CollectionConfig { retain: 3, ..CollectionConfig::default() };
	let (engine, _temp) = engine_with(config).await;
	let source = TextSource::new();
	write_n(&engine, &source, "a", 10).await;

	engine.compact("tasks", "a").await.unwrap();

	let store = engine.log().store();
	let rows = store.document_deltas("tasks", "a", 0, None, 100).await.unwrap();
	let seqs: Vec<u64> = rows.iter().map(|r| r.seq).collect();
	assert_eq!(seqs, vec![8, 9, 10]);
	assert_eq!(store.delta_count("tasks", "a").await.unwrap(), 3);
}

#[tokio::test]
async fn at_most_one_job_is_queued_per_document() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	write_n(&engine, &source, "a", 3).await;

	// Queue a job without a background driver, then freeze it in running
	let store = engine.log().store();
	use driftsync_types::log_store::CompactionRow;
	assert!(store.try_schedule_job(&CompactionRow::pending("tasks", "a", 3600, 0)).await.unwrap());
	engine.run_compaction("tasks", "a").await.unwrap();
	let job = engine.compaction_status("tasks", "a").await.unwrap().unwrap();
	assert_eq!(job.status, JobStatus::Running);

	assert!(
		!engine.schedule_compaction("tasks", "a", WriteHints::default()).await.unwrap(),
		"a queued job must not be scheduled twice"
	);

	// Another document is independent
	write_n(&engine, &source, "b", 1).await;
	assert!(engine.schedule_compaction("tasks", "b", WriteHints::default()).await.unwrap());
}

#[tokio::test]
async fn threshold_crossing_schedules_compaction() {
	let config = CollectionConfig { threshold: 5, ..CollectionConfig::default() };
	let (engine, _temp) = engine_with(config).await;
	let source = TextSource::new();
	write_n(&engine, &source, "a", 5).await;

	// The write path queued a job; wait for the detached driver to finish it
	let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
	loop {
		if let Some(job) = engine.compaction_status("tasks", "a").await.unwrap() {
			if job.status == JobStatus::Done {
				break;
			}
		}
		assert!(std::time::Instant::now() < deadline, "compaction did not finish in time");
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
	}

	let snapshot = engine.log().snapshot("tasks", "a").await.unwrap().unwrap();
	assert_eq!(snapshot.seq, 5);
	assert_eq!(text_of(&[snapshot.bytes]), source.text());
}

#[tokio::test]
async fn boundary_fences_out_concurrent_writes() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	write_n(&engine, &source, "a", 6).await;

	// Freeze the boundary (pending -> running), then let more writes land
	engine.schedule_compaction("tasks", "a", WriteHints::default()).await.unwrap();
	while engine.compaction_status("tasks", "a").await.unwrap().unwrap().boundary_seq.is_none() {
		engine.run_compaction("tasks", "a").await.unwrap();
	}
	let late = source.edit("late ");
	engine.update_document("tasks", "a", &late, WriteHints::default()).await.unwrap();

	engine.compact("tasks", "a").await.unwrap();

	// The late delta is past the boundary: not absorbed, not pruned
	let snapshot = engine.log().snapshot("tasks", "a").await.unwrap().unwrap();
	assert_eq!(snapshot.seq, 6);
	assert!(!text_of(&[snapshot.bytes.clone()]).contains("late"));

	let store = engine.log().store();
	let rows = store.document_deltas("tasks", "a", 0, None, 100).await.unwrap();
	let seqs: Vec<u64> = rows.iter().map(|r| r.seq).collect();
	assert_eq!(seqs, vec![7]);

	// Snapshot plus the retained tail still converge with the writer
	assert_eq!(text_of(&[snapshot.bytes, rows[0].bytes.clone()]), source.text());
}

#[tokio::test]
async fn paged_merge_handles_chains_larger_than_one_step() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	// More than max_pages * page_size (4 * 64) deltas forces multiple steps
	let deltas = write_n(&engine, &source, "a", 300).await;

	engine.compact("tasks", "a").await.unwrap();

	let job = engine.compaction_status("tasks", "a").await.unwrap().unwrap();
	assert_eq!(job.status, JobStatus::Done);
	assert_eq!(job.processed, 300);

	let snapshot = engine.log().snapshot("tasks", "a").await.unwrap().unwrap();
	assert_eq!(text_of(&[snapshot.bytes]), text_of(&deltas));
}

#[tokio::test]
async fn compaction_deletes_timed_out_sessions() {
	let config = CollectionConfig { session_timeout_secs: 60, ..CollectionConfig::default() };
	let (engine, _temp) = engine_with(config).await;
	let source = TextSource::new();
	write_n(&engine, &source, "a", 2).await;

	// A disconnected session last seen beyond the timeout window
	use driftsync_types::log_store::SessionRow;
	use driftsync_types::types::Timestamp;
	engine
		.log()
		.store()
		.upsert_session(&SessionRow {
			collection: "tasks".into(),
			document: "a".into(),
			client: "ghost".into(),
			connected: false,
			seq: 0,
			seen: Timestamp(Timestamp::now().0 - 3600),
			vector: None,
			user: None,
			profile: None,
			cursor: None,
			deadline: None,
		})
		.await
		.unwrap();

	engine.compact("tasks", "a").await.unwrap();

	assert!(engine.log().store().session("tasks", "a", "ghost").await.unwrap().is_none());
}

// vim: ts=4
