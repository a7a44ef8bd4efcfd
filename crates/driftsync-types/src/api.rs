//! Server operation contracts.
//!
//! The named interface between the client replication stack and the server
//! engine. Transport is a collaborator concern: an HTTP or WebSocket host
//! maps its calls onto this trait, and tests wire the client straight to an
//! in-process engine. Auth stays outside; `client` and `user` are opaque
//! identity values supplied by the host.

use async_trait::async_trait;
use futures_core::Stream;
use serde_json::Value;
use std::pin::Pin;

use crate::prelude::*;

/// Envelope for one change delivered over the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
	Delta,
	Snapshot,
}

#[derive(Debug, Clone)]
pub struct Change {
	pub collection: Box<str>,
	pub document: Box<str>,
	pub bytes: Vec<u8>,
	pub seq: u64,
	pub kind: ChangeKind,
	/// False on logical-delete tombstone deltas
	pub exists: bool,
}

/// One catch-up batch. `seq` is the max seq the caller has observed after
/// applying the batch; `more` signals another immediate round is needed.
#[derive(Debug, Clone, Default)]
pub struct StreamBatch {
	pub changes: Vec<Change>,
	pub seq: u64,
	pub more: bool,
}

/// Reply to a recovery request. `diff` is absent when the server holds no
/// state for the document.
#[derive(Debug, Clone)]
pub struct RecoveryReply {
	pub diff: Option<Vec<u8>>,
	/// Server's authoritative state vector for the document
	pub vector: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DocumentState {
	pub bytes: Vec<u8>,
	pub seq: u64,
}

/// Acknowledgement of a write mutation.
#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
	pub seq: u64,
}

/// Per-call overrides for compaction tuning, carried on write mutations.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteHints {
	pub threshold: Option<u32>,
	pub timeout_secs: Option<i64>,
	pub retain: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
	Join,
	Leave,
}

/// Payload of a presence call; all fields optional on leave.
#[derive(Debug, Clone, Default)]
pub struct PresenceUpdate {
	pub user: Option<Box<str>>,
	pub profile: Option<Value>,
	pub cursor: Option<Value>,
	/// Heartbeat interval the peer promises; disconnect is scheduled at
	/// 2.5x this
	pub interval_secs: Option<u32>,
	pub vector: Option<Vec<u8>>,
}

/// Public view of a session row, as returned by the `sessions` query.
#[derive(Debug, Clone)]
pub struct SessionInfo {
	pub client: Box<str>,
	pub user: Option<Box<str>>,
	pub profile: Option<Value>,
	pub cursor: Option<Value>,
	pub connected: bool,
	pub seq: u64,
	pub seen: Timestamp,
}

/// Stream of head-seq notifications for a collection.
pub type ChangeFeed = Pin<Box<dyn Stream<Item = u64> + Send>>;

#[async_trait]
pub trait SyncApi: Send + Sync {
	// Write mutations
	//*****************

	async fn insert_document(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		hints: WriteHints,
	) -> DsResult<WriteOutcome>;

	async fn update_document(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		hints: WriteHints,
	) -> DsResult<WriteOutcome>;

	/// Records a delete-marker delta (`exists = false`).
	async fn delete_document(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		hints: WriteHints,
	) -> DsResult<WriteOutcome>;

	// Catch-up & recovery
	//*********************

	async fn stream(
		&self,
		collection: &str,
		cursor: u64,
		limit: Option<u32>,
	) -> DsResult<StreamBatch>;

	async fn recovery(
		&self,
		collection: &str,
		document: &str,
		vector: Option<&[u8]>,
	) -> DsResult<RecoveryReply>;

	async fn document_state(
		&self,
		collection: &str,
		document: &str,
	) -> DsResult<Option<DocumentState>>;

	/// Head-seq notifications; the replicator awaits this between rounds.
	async fn subscribe(&self, collection: &str) -> DsResult<ChangeFeed>;

	// Presence & progress
	//*********************

	async fn presence(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		action: PresenceAction,
		update: PresenceUpdate,
	) -> DsResult<()>;

	async fn mark(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		seq: Option<u64>,
		vector: Option<Vec<u8>>,
	) -> DsResult<()>;

	async fn sessions(
		&self,
		collection: &str,
		document: &str,
		connected: Option<bool>,
		exclude: Option<&str>,
	) -> DsResult<Vec<SessionInfo>>;
}

// vim: ts=4
