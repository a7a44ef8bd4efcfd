//! Document persistence provider.
//!
//! Bridges one CRDT document to the cache adapter: hydrates the document
//! from the stored snapshot and deltas (in insertion order), then persists
//! every later update whose origin is not the storage layer itself. Writes
//! flow through an unbounded channel into a writer task, so an async backend
//! never blocks the editing path; `flush` drains the pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use yrs::Doc;

use crate::docs::apply_with_origin;
use crate::prelude::*;
use driftsync_types::cache_adapter::CacheAdapter;

/// Per-write retry budget before a delta is abandoned with an error log.
const WRITE_RETRIES: u32 = 5;
const WRITE_RETRY_BASE_MS: u64 = 20;

pub struct DocPersistence {
	scope: Box<str>,
	adapter: Arc<dyn CacheAdapter>,
	pending: Arc<AtomicUsize>,
	drained: Arc<Notify>,
	_sub: yrs::Subscription,
}

impl DocPersistence {
	/// Hydrate `doc` from storage and subscribe to its update stream.
	/// Returns once the document reflects the persisted state, which is the
	/// provider's "synced" point.
	pub async fn attach(
		adapter: Arc<dyn CacheAdapter>,
		scope: &str,
		doc: &Doc,
	) -> DsResult<Self> {
		let load = adapter.load_document(scope).await?;
		if let Some(snapshot) = &load.snapshot {
			apply_with_origin(doc, &snapshot.bytes, Origin::Storage)?;
		}
		for delta in &load.deltas {
			apply_with_origin(doc, delta, Origin::Storage)?;
		}
		trace!("hydrated {} ({} deltas)", scope, load.deltas.len());

		let pending = Arc::new(AtomicUsize::new(0));
		let drained = Arc::new(Notify::new());
		let (tx, rx) = flume::unbounded::<Vec<u8>>();

		let storage_origin: yrs::Origin = Origin::Storage.into();
		let counter = Arc::clone(&pending);
		let sub = doc
			.observe_update_v1(move |txn, event| {
				// Our own hydration writes must not loop back into storage
				if txn.origin() == Some(&storage_origin) {
					return;
				}
				counter.fetch_add(1, Ordering::SeqCst);
				let _ = tx.send(event.update.clone());
			})
			.map_err(|e| Error::Internal(format!("update observer: {}", e)))?;

		tokio::spawn(writer(
			Arc::clone(&adapter),
			scope.into(),
			rx,
			Arc::clone(&pending),
			Arc::clone(&drained),
		));

		Ok(Self { scope: scope.into(), adapter, pending, drained, _sub: sub })
	}

	pub fn scope(&self) -> &str {
		&self.scope
	}

	/// Wait until every queued update reached the adapter, then drain the
	/// adapter's own pipeline.
	pub async fn flush(&self) -> DsResult<()> {
		loop {
			if self.pending.load(Ordering::SeqCst) == 0 {
				break;
			}
			let notified = self.drained.notified();
			tokio::pin!(notified);
			// Register before the re-check so a drain between the check and
			// the await cannot be missed
			notified.as_mut().enable();
			if self.pending.load(Ordering::SeqCst) == 0 {
				break;
			}
			notified.await;
		}
		self.adapter.flush().await
	}

	/// Drain pending writes and stop persisting. The writer task ends when
	/// the dropped subscription closes its channel.
	pub async fn close(self) -> DsResult<()> {
		self.flush().await
	}
}

async fn writer(
	adapter: Arc<dyn CacheAdapter>,
	scope: Box<str>,
	rx: flume::Receiver<Vec<u8>>,
	pending: Arc<AtomicUsize>,
	drained: Arc<Notify>,
) {
	while let Ok(bytes) = rx.recv_async().await {
		let mut attempt = 0;
		loop {
			match adapter.append_delta(&scope, &bytes).await {
				Ok(()) => break,
				Err(e) if e.is_retriable() && attempt < WRITE_RETRIES => {
					attempt += 1;
					warn!("cache write for {} failed (attempt {}): {}", scope, attempt, e);
					tokio::time::sleep(std::time::Duration::from_millis(
						WRITE_RETRY_BASE_MS * u64::from(attempt),
					))
					.await;
				}
				Err(e) => {
					error!("dropping cache write for {} after {} attempts: {}", scope, attempt, e);
					break;
				}
			}
		}
		pending.fetch_sub(1, Ordering::SeqCst);
		drained.notify_waiters();
	}
}

impl std::fmt::Debug for DocPersistence {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DocPersistence")
			.field("scope", &self.scope)
			.field("pending", &self.pending.load(Ordering::Relaxed))
			.finish()
	}
}

// vim: ts=4
