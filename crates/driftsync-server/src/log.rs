//! Append-only event log.
//!
//! Appends deltas under the per-collection monotonic sequence counter,
//! streams changes since a caller-supplied cursor, and reconstructs document
//! state for recovery. The disparity path (caller's cursor older than the
//! oldest retained delta) re-bases the caller from current snapshots.
//!
//! Change fan-out uses a per-collection broadcast channel; subscribers
//! receive head-seq notifications and pull the actual changes through
//! `stream`.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::prelude::*;
use driftsync_types::api::{Change, ChangeFeed, ChangeKind, StreamBatch};
use driftsync_types::crdt;
use driftsync_types::log_store::{AppendResult, LogStore, SnapshotRow};

/// Default page size for `stream` when the caller gives no limit.
pub const DEFAULT_STREAM_LIMIT: u32 = 100;

/// Page size for state reconstruction.
const RECONSTRUCT_PAGE: u32 = 256;

/// Capacity of the per-collection head-seq broadcast channel.
const FEED_CAPACITY: usize = 1024;

pub struct ServerLog {
	store: Arc<dyn LogStore>,
	feeds: DashMap<Box<str>, broadcast::Sender<u64>>,
}

impl ServerLog {
	pub fn new(store: Arc<dyn LogStore>) -> Self {
		Self { store, feeds: DashMap::new() }
	}

	fn feed(&self, collection: &str) -> broadcast::Sender<u64> {
		if let Some(tx) = self.feeds.get(collection) {
			return tx.clone();
		}
		self.feeds
			.entry(collection.into())
			.or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
			.clone()
	}

	/// Append one delta. Allocation, insert and the delta-count bump are one
	/// atomic store step; subscribers are notified afterwards.
	pub async fn append(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		exists: bool,
	) -> DsResult<AppendResult> {
		if crdt::is_empty_update(bytes) {
			return Err(Error::EmptyDelta);
		}
		let result = self.store.append_delta(collection, document, bytes, exists).await?;
		trace!(
			"appended delta {}/{} seq={} ({} bytes)",
			collection,
			document,
			result.seq,
			bytes.len()
		);
		// Nobody listening is fine
		let _ = self.feed(collection).send(result.seq);
		Ok(result)
	}

	/// Deltas with `seq > cursor` in ascending order, up to `limit`. Falls
	/// back to the disparity response when the cursor is behind the oldest
	/// retained delta.
	pub async fn stream(
		&self,
		collection: &str,
		cursor: u64,
		limit: Option<u32>,
	) -> DsResult<StreamBatch> {
		let limit = limit.unwrap_or(DEFAULT_STREAM_LIMIT).clamp(1, 10_000);
		let oldest = self.store.oldest_seq(collection).await?;

		// Gap test: the first delta the caller needs is already pruned
		let gap = match oldest {
			Some(oldest) => cursor + 1 < oldest,
			None => false,
		};
		if gap {
			return self.disparity(collection).await;
		}

		let mut rows = self.store.deltas_after(collection, cursor, limit + 1).await?;
		if !rows.is_empty() {
			let more = rows.len() as u32 > limit;
			rows.truncate(limit as usize);
			let seq = rows.last().map_or(cursor, |row| row.seq);
			let changes = rows
				.into_iter()
				.map(|row| Change {
					collection: row.collection,
					document: row.document,
					bytes: row.bytes,
					seq: row.seq,
					kind: ChangeKind::Delta,
					exists: row.exists,
				})
				.collect();
			return Ok(StreamBatch { changes, seq, more });
		}

		// Nothing newer retained. If the counter moved past the cursor while
		// no deltas exist at all, everything was compacted away.
		if oldest.is_none() && self.store.current_seq(collection).await? > cursor {
			return self.disparity(collection).await;
		}

		Ok(StreamBatch { changes: Vec::new(), seq: cursor, more: false })
	}

	/// Disparity response: every current snapshot, then every retained delta
	/// not absorbed by its document's snapshot, ascending. The baseline must
	/// be complete, so paging does not apply here.
	async fn disparity(&self, collection: &str) -> DsResult<StreamBatch> {
		let mut snapshots = self.store.snapshots(collection).await?;
		if snapshots.is_empty() {
			warn!("disparity on {} with no snapshots", collection);
			return Err(Error::MissingBaseline);
		}
		snapshots.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.document.cmp(&b.document)));

		let boundary: HashMap<Box<str>, u64> =
			snapshots.iter().map(|s| (s.document.clone(), s.seq)).collect();

		let mut seq = 0;
		let mut changes = Vec::with_capacity(snapshots.len());
		for snap in snapshots {
			seq = seq.max(snap.seq);
			changes.push(Change {
				collection: snap.collection,
				document: snap.document,
				bytes: snap.bytes,
				seq: snap.seq,
				kind: ChangeKind::Snapshot,
				exists: true,
			});
		}

		let deltas = self.store.deltas_after(collection, 0, u32::MAX).await?;
		for row in deltas {
			if row.seq <= boundary.get(&row.document).copied().unwrap_or(0) {
				continue;
			}
			seq = seq.max(row.seq);
			changes.push(Change {
				collection: row.collection,
				document: row.document,
				bytes: row.bytes,
				seq: row.seq,
				kind: ChangeKind::Delta,
				exists: row.exists,
			});
		}

		debug!("disparity response for {}: {} changes up to seq {}", collection, changes.len(), seq);
		Ok(StreamBatch { changes, seq, more: false })
	}

	/// Rebuild one document's state from snapshot plus retained deltas.
	/// Returns the merged state blob and the highest seq it accounts for.
	pub async fn reconstruct(
		&self,
		collection: &str,
		document: &str,
	) -> DsResult<Option<(Vec<u8>, u64)>> {
		let snapshot = self.store.snapshot(collection, document).await?;
		let (mut state, mut seq) = match snapshot {
			Some(snap) => (Some(snap.bytes), snap.seq),
			None => (None, 0),
		};

		let mut after = seq;
		loop {
			let rows = self
				.store
				.document_deltas(collection, document, after, None, RECONSTRUCT_PAGE)
				.await?;
			if rows.is_empty() {
				break;
			}
			after = rows.last().map_or(after, |row| row.seq);
			seq = seq.max(after);
			let mut blobs: Vec<&[u8]> = Vec::with_capacity(rows.len() + 1);
			if let Some(prev) = state.as_deref() {
				blobs.push(prev);
			}
			blobs.extend(rows.iter().map(|row| row.bytes.as_slice()));
			state = Some(crdt::merge_updates(blobs)?);
		}

		Ok(state.map(|bytes| (bytes, seq)))
	}

	/// Catch a peer up in one blob: diff of the reconstructed state against
	/// the peer's reported state vector, plus the authoritative vector.
	pub async fn recovery(
		&self,
		collection: &str,
		document: &str,
		peer_vector: Option<&[u8]>,
	) -> DsResult<(Option<Vec<u8>>, Vec<u8>)> {
		match self.reconstruct(collection, document).await? {
			Some((state, _seq)) => {
				let diff = crdt::diff_update(&state, peer_vector)?;
				let vector = crdt::state_vector(&state)?;
				Ok((Some(diff), vector))
			}
			None => Ok((None, crdt::state_vector(&crdt::empty_state())?)),
		}
	}

	/// Head-seq notification feed for a collection.
	pub fn subscribe(&self, collection: &str) -> ChangeFeed {
		let rx = self.feed(collection).subscribe();
		let stream = async_stream::stream! {
			let mut rx = rx;
			loop {
				match rx.recv().await {
					Ok(seq) => yield seq,
					Err(broadcast::error::RecvError::Lagged(_)) => continue,
					Err(broadcast::error::RecvError::Closed) => return,
				}
			}
		};
		Box::pin(stream)
	}

	pub fn store(&self) -> &Arc<dyn LogStore> {
		&self.store
	}

	/// Snapshot accessor used by server-side rendering helpers.
	pub async fn snapshot(
		&self,
		collection: &str,
		document: &str,
	) -> DsResult<Option<SnapshotRow>> {
		self.store.snapshot(collection, document).await
	}
}

impl std::fmt::Debug for ServerLog {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServerLog").field("feeds", &self.feeds.len()).finish()
	}
}

// vim: ts=4
