//! Event log and stream tests
//!
//! Covers cold-start, ordering, paging, the disparity recovery path, and
//! the append validation rules.

mod common;

use common::{engine, text_of, TextSource};
use futures::StreamExt;
use std::sync::Arc;

use driftsync_types::api::{ChangeKind, SyncApi, WriteHints};
use driftsync_types::error::Error;

#[tokio::test]
async fn fresh_client_on_empty_collection_gets_empty_batch() {
	let (engine, _temp) = engine().await;

	let batch = engine.stream("tasks", 0, None).await.unwrap();
	assert!(batch.changes.is_empty());
	assert_eq!(batch.seq, 0);
	assert!(!batch.more);
}

#[tokio::test]
async fn deltas_stream_in_ascending_seq_order() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();

	for i in 0..5 {
		let delta = source.edit(&format!("edit{} ", i));
		engine.update_document("tasks", "a", &delta, WriteHints::default()).await.unwrap();
	}

	let batch = engine.stream("tasks", 0, None).await.unwrap();
	let seqs: Vec<u64> = batch.changes.iter().map(|c| c.seq).collect();
	assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
	assert_eq!(batch.seq, 5);
	assert!(!batch.more);
	assert!(batch.changes.iter().all(|c| c.kind == ChangeKind::Delta));

	// Applying the streamed deltas reproduces the writer's text
	let blobs: Vec<Vec<u8>> = batch.changes.into_iter().map(|c| c.bytes).collect();
	assert_eq!(text_of(&blobs), source.text());
}

#[tokio::test]
async fn stream_pages_with_more_flag() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	for i in 0..7 {
		let delta = source.edit(&format!("{} ", i));
		engine.update_document("tasks", "a", &delta, WriteHints::default()).await.unwrap();
	}

	let first = engine.stream("tasks", 0, Some(3)).await.unwrap();
	assert_eq!(first.changes.len(), 3);
	assert_eq!(first.seq, 3);
	assert!(first.more);

	let second = engine.stream("tasks", first.seq, Some(3)).await.unwrap();
	assert_eq!(second.seq, 6);
	assert!(second.more);

	let third = engine.stream("tasks", second.seq, Some(3)).await.unwrap();
	assert_eq!(third.changes.len(), 1);
	assert_eq!(third.seq, 7);
	assert!(!third.more);
}

#[tokio::test]
async fn caught_up_cursor_gets_empty_batch() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	let delta = source.edit("hi");
	engine.insert_document("tasks", "a", &delta, WriteHints::default()).await.unwrap();

	let batch = engine.stream("tasks", 1, None).await.unwrap();
	assert!(batch.changes.is_empty());
	assert_eq!(batch.seq, 1);
}

#[tokio::test]
async fn empty_payload_is_rejected() {
	let (engine, _temp) = engine().await;
	assert!(matches!(
		engine.insert_document("tasks", "a", &[], WriteHints::default()).await,
		Err(Error::EmptyDelta)
	));
	// A no-op yrs update carries no operations either
	let empty = TextSource::new().state();
	assert!(matches!(
		engine.insert_document("tasks", "a", &empty, WriteHints::default()).await,
		Err(Error::EmptyDelta)
	));
}

#[tokio::test]
async fn concurrent_appends_allocate_unique_ascending_seqs() {
	let (engine, _temp) = engine().await;

	let mut handles = Vec::new();
	for worker in 0..4 {
		let engine = Arc::clone(&engine);
		handles.push(tokio::spawn(async move {
			let source = TextSource::new();
			let mut seqs = Vec::new();
			for i in 0..10 {
				let delta = source.edit(&format!("w{}e{} ", worker, i));
				let outcome = engine
					.update_document("tasks", &format!("doc{}", worker), &delta, WriteHints::default())
					.await
					.unwrap();
				seqs.push(outcome.seq);
			}
			seqs
		}));
	}

	let mut all: Vec<u64> = Vec::new();
	for handle in handles {
		let seqs = handle.await.unwrap();
		// Per-writer observations are strictly increasing
		assert!(seqs.windows(2).all(|w| w[0] < w[1]));
		all.extend(seqs);
	}
	all.sort_unstable();
	all.dedup();
	assert_eq!(all.len(), 40, "no two appends may observe the same seq");
	assert_eq!(*all.last().unwrap(), 40);
}

#[tokio::test]
async fn disparity_returns_snapshots_then_newer_deltas() {
	let (engine, _temp) = engine().await;
	let a = TextSource::new();
	let b = TextSource::new();

	// 50 writes across two documents, then compact both away
	for i in 0..25 {
		let delta = a.edit(&format!("a{} ", i));
		engine.update_document("tasks", "a", &delta, WriteHints::default()).await.unwrap();
		let delta = b.edit(&format!("b{} ", i));
		engine.update_document("tasks", "b", &delta, WriteHints::default()).await.unwrap();
	}
	engine.compact("tasks", "a").await.unwrap();
	engine.compact("tasks", "b").await.unwrap();

	// Two post-snapshot deltas
	let delta = a.edit("tail1 ");
	engine.update_document("tasks", "a", &delta, WriteHints::default()).await.unwrap();
	let delta = b.edit("tail2 ");
	engine.update_document("tasks", "b", &delta, WriteHints::default()).await.unwrap();

	// A client whose cursor predates the oldest retained delta re-bases
	let batch = engine.stream("tasks", 10, None).await.unwrap();
	let kinds: Vec<ChangeKind> = batch.changes.iter().map(|c| c.kind).collect();
	assert_eq!(
		kinds,
		vec![ChangeKind::Snapshot, ChangeKind::Snapshot, ChangeKind::Delta, ChangeKind::Delta]
	);
	assert_eq!(batch.seq, 52);
	assert!(!batch.more);

	// Applying the batch per document converges with the writers
	let a_blobs: Vec<Vec<u8>> = batch
		.changes
		.iter()
		.filter(|c| c.document.as_ref() == "a")
		.map(|c| c.bytes.clone())
		.collect();
	assert_eq!(text_of(&a_blobs), a.text());
	let b_blobs: Vec<Vec<u8>> = batch
		.changes
		.iter()
		.filter(|c| c.document.as_ref() == "b")
		.map(|c| c.bytes.clone())
		.collect();
	assert_eq!(text_of(&b_blobs), b.text());
}

#[tokio::test]
async fn disparity_without_snapshots_is_fatal() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	for i in 0..3 {
		let delta = source.edit(&format!("{} ", i));
		engine.update_document("tasks", "a", &delta, WriteHints::default()).await.unwrap();
	}
	// Simulate an operator pruning the log without leaving a snapshot
	engine.log().store().prune_deltas("tasks", "a", 3, 0).await.unwrap();

	assert!(matches!(engine.stream("tasks", 0, None).await, Err(Error::MissingBaseline)));
}

#[tokio::test]
async fn recovery_diff_catches_peer_up_in_one_blob() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	let mut deltas = Vec::new();
	for i in 0..4 {
		let delta = source.edit(&format!("{} ", i));
		deltas.push(delta.clone());
		engine.update_document("tasks", "a", &delta, WriteHints::default()).await.unwrap();
	}

	// Peer saw only the first two deltas
	let peer_vector = common::vector_after(&deltas[..2]);
	let reply = engine.recovery("tasks", "a", Some(&peer_vector)).await.unwrap();
	let diff = reply.diff.unwrap();

	let mut blobs = deltas[..2].to_vec();
	blobs.push(diff);
	assert_eq!(text_of(&blobs), source.text());
}

#[tokio::test]
async fn recovery_on_unknown_document_returns_no_diff() {
	let (engine, _temp) = engine().await;
	let reply = engine.recovery("tasks", "ghost", None).await.unwrap();
	assert!(reply.diff.is_none());
}

#[tokio::test]
async fn document_state_reconstructs_snapshot_plus_tail() {
	let (engine, _temp) = engine().await;
	let source = TextSource::new();
	for i in 0..5 {
		let delta = source.edit(&format!("{} ", i));
		engine.update_document("tasks", "a", &delta, WriteHints::default()).await.unwrap();
	}
	engine.compact("tasks", "a").await.unwrap();
	let delta = source.edit("after ");
	engine.update_document("tasks", "a", &delta, WriteHints::default()).await.unwrap();

	let state = engine.document_state("tasks", "a").await.unwrap().unwrap();
	assert_eq!(state.seq, 6);
	assert_eq!(text_of(&[state.bytes]), source.text());

	assert!(engine.document_state("tasks", "ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn subscribers_observe_head_movement() {
	let (engine, _temp) = engine().await;
	let mut feed = engine.subscribe("tasks").await.unwrap();

	let source = TextSource::new();
	let delta = source.edit("hi");
	let outcome = engine.insert_document("tasks", "a", &delta, WriteHints::default()).await.unwrap();

	let head = tokio::time::timeout(std::time::Duration::from_secs(1), feed.next())
		.await
		.expect("notification within a second")
		.expect("feed open");
	assert_eq!(head, outcome.seq);
}

// vim: ts=4
