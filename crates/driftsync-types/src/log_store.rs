//! Server log persistence contract.
//!
//! Trait and row types for pluggable backends holding the append-only delta
//! log, per-document snapshots, the per-collection sequence counter, session
//! rows, and persisted compaction job state. The engine defines the
//! operations it needs; how a backend maps them onto its storage is the
//! adapter's concern.
//!
//! Atomicity requirements:
//! - `append_delta` allocates the next sequence number, inserts the delta and
//!   bumps the cached per-document delta count as one atomic step. Concurrent
//!   appends serialize on the counter; no two may observe the same seq.
//! - `mark_session` must never regress the stored seq (monotonic update).
//! - `try_schedule_job` enforces at most one pending-or-running job per
//!   `(collection, document)` at schedule time.
//!
//! Counters are seeded lazily: the sequence counter from `max(seq)` over
//! existing deltas, the delta count from `COUNT(*)`, so adopting a
//! pre-existing deltas table preserves monotonicity.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;

use crate::prelude::*;

/// One record of the append-only server-side delta log. `bytes` is never
/// mutated after insert.
#[derive(Debug, Clone)]
pub struct DeltaRow {
	pub collection: Box<str>,
	pub document: Box<str>,
	pub bytes: Vec<u8>,
	/// Strictly increasing and unique within a collection
	pub seq: u64,
	/// False marks a logical-delete tombstone write
	pub exists: bool,
}

/// Merged state for one document. At most one row per (collection, document).
#[derive(Debug, Clone)]
pub struct SnapshotRow {
	pub collection: Box<str>,
	pub document: Box<str>,
	pub bytes: Vec<u8>,
	/// State vector of `bytes`
	pub vector: Vec<u8>,
	/// Boundary seq this snapshot accounts for
	pub seq: u64,
	pub created: Timestamp,
}

/// A peer's presence and sync-progress record.
#[derive(Debug, Clone)]
pub struct SessionRow {
	pub collection: Box<str>,
	pub document: Box<str>,
	pub client: Box<str>,
	pub connected: bool,
	/// Last seq the peer acknowledged; only ever advances
	pub seq: u64,
	pub seen: Timestamp,
	/// Peer's last reported state vector
	pub vector: Option<Vec<u8>>,
	pub user: Option<Box<str>>,
	pub profile: Option<Value>,
	pub cursor: Option<Value>,
	/// When the scheduled disconnect fires unless renewed by a heartbeat
	pub deadline: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
	Pending,
	Running,
	Done,
	Failed,
}

impl JobStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			JobStatus::Pending => "pending",
			JobStatus::Running => "running",
			JobStatus::Done => "done",
			JobStatus::Failed => "failed",
		}
	}

	pub fn parse(s: &str) -> DsResult<Self> {
		match s {
			"pending" => Ok(JobStatus::Pending),
			"running" => Ok(JobStatus::Running),
			"done" => Ok(JobStatus::Done),
			"failed" => Ok(JobStatus::Failed),
			_ => Err(Error::Internal(format!("unknown job status: {}", s))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
	Merge,
	Finalize,
}

impl JobPhase {
	pub fn as_str(self) -> &'static str {
		match self {
			JobPhase::Merge => "merge",
			JobPhase::Finalize => "finalize",
		}
	}

	pub fn parse(s: &str) -> DsResult<Self> {
		match s {
			"merge" => Ok(JobPhase::Merge),
			"finalize" => Ok(JobPhase::Finalize),
			_ => Err(Error::Internal(format!("unknown job phase: {}", s))),
		}
	}
}

/// Persisted compaction job state machine record. One row per
/// (collection, document); scheduling replaces a finished row.
#[derive(Debug, Clone)]
pub struct CompactionRow {
	pub collection: Box<str>,
	pub document: Box<str>,
	pub status: JobStatus,
	pub phase: JobPhase,
	/// Paging key: last delta seq merged so far
	pub cursor: Option<u64>,
	/// Sequence counter frozen at job start; the TOCTOU fence
	pub boundary_seq: Option<u64>,
	/// Partially merged state between steps
	pub scratch: Option<Vec<u8>>,
	pub processed: u32,
	pub retries: u32,
	/// Session inactivity cutoff used by the finalize phase
	pub timeout_secs: i64,
	pub page_size: u32,
	pub max_pages: u32,
	pub max_deltas: u32,
	pub retain: u32,
	pub started: Timestamp,
	pub completed: Option<Timestamp>,
	pub error: Option<Box<str>>,
}

/// Result of an atomic delta append.
#[derive(Debug, Clone, Copy)]
pub struct AppendResult {
	pub seq: u64,
	/// Cached delta count for the document after the insert
	pub count: u64,
}

#[async_trait]
pub trait LogStore: Send + Sync + Debug {
	// Deltas & sequences
	//********************

	/// Allocate `seq = counter + 1`, insert the delta, bump the delta count.
	async fn append_delta(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		exists: bool,
	) -> DsResult<AppendResult>;

	/// Current value of the collection's sequence counter (0 if untouched).
	async fn current_seq(&self, collection: &str) -> DsResult<u64>;

	/// Deltas with `seq > cursor`, ascending, across all documents.
	async fn deltas_after(
		&self,
		collection: &str,
		cursor: u64,
		limit: u32,
	) -> DsResult<Vec<DeltaRow>>;

	/// Deltas of one document with `after < seq <= up_to`, ascending.
	async fn document_deltas(
		&self,
		collection: &str,
		document: &str,
		after: u64,
		up_to: Option<u64>,
		limit: u32,
	) -> DsResult<Vec<DeltaRow>>;

	/// Seq of the oldest retained delta in the collection, if any.
	async fn oldest_seq(&self, collection: &str) -> DsResult<Option<u64>>;

	/// Delete the document's deltas with `seq <= up_to`, keeping the
	/// `retain` highest-seq ones. Returns how many were deleted; the cached
	/// delta count is decremented by the same amount.
	async fn prune_deltas(
		&self,
		collection: &str,
		document: &str,
		up_to: u64,
		retain: u32,
	) -> DsResult<u64>;

	/// O(1) cached count of the document's deltas.
	async fn delta_count(&self, collection: &str, document: &str) -> DsResult<u64>;

	// Snapshots
	//***********

	async fn snapshot(&self, collection: &str, document: &str) -> DsResult<Option<SnapshotRow>>;
	async fn snapshots(&self, collection: &str) -> DsResult<Vec<SnapshotRow>>;
	async fn upsert_snapshot(&self, row: &SnapshotRow) -> DsResult<()>;

	// Sessions
	//**********

	async fn upsert_session(&self, row: &SessionRow) -> DsResult<()>;
	async fn session(
		&self,
		collection: &str,
		document: &str,
		client: &str,
	) -> DsResult<Option<SessionRow>>;
	async fn sessions(&self, collection: &str, document: &str) -> DsResult<Vec<SessionRow>>;

	/// Refresh `seen`, monotonically advance `seq`, optionally replace the
	/// state vector. A no-op when the session row does not exist.
	async fn mark_session(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		seq: Option<u64>,
		vector: Option<Vec<u8>>,
		seen: Timestamp,
	) -> DsResult<()>;

	/// Set `connected = false`, clear cursor and deadline.
	async fn set_disconnected(
		&self,
		collection: &str,
		document: &str,
		client: &str,
	) -> DsResult<()>;

	/// Delete disconnected sessions last seen before the cutoff.
	async fn delete_stale_sessions(
		&self,
		collection: &str,
		document: &str,
		seen_before: Timestamp,
	) -> DsResult<u64>;

	// Compaction jobs
	//*****************

	/// Insert a fresh pending job unless a pending or running one already
	/// exists for the document. Returns whether the job was scheduled.
	async fn try_schedule_job(&self, row: &CompactionRow) -> DsResult<bool>;

	async fn job(&self, collection: &str, document: &str) -> DsResult<Option<CompactionRow>>;
	async fn update_job(&self, row: &CompactionRow) -> DsResult<()>;
}

impl CompactionRow {
	/// Fresh pending job with the engine's paging defaults.
	pub fn pending(collection: &str, document: &str, timeout_secs: i64, retain: u32) -> Self {
		Self {
			collection: collection.into(),
			document: document.into(),
			status: JobStatus::Pending,
			phase: JobPhase::Merge,
			cursor: None,
			boundary_seq: None,
			scratch: None,
			processed: 0,
			retries: 0,
			timeout_secs,
			page_size: 64,
			max_pages: 4,
			max_deltas: 256,
			retain,
			started: Timestamp::now(),
			completed: None,
			error: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_and_phase_round_trip() {
		for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Done, JobStatus::Failed] {
			assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
		}
		for phase in [JobPhase::Merge, JobPhase::Finalize] {
			assert_eq!(JobPhase::parse(phase.as_str()).unwrap(), phase);
		}
		assert!(JobStatus::parse("bogus").is_err());
	}
}

// vim: ts=4
