//! Client cache adapter contract.
//!
//! Trait for pluggable durable local stores holding per-document snapshot
//! and delta blobs plus a small JSON key-value namespace. Documents are
//! addressed by a *scope* string ("{collection}:{document}").
//!
//! Requirements on implementations:
//! - Writes are at-least-once; pending async writes must be drainable via
//!   `flush`, and `close` drains them before releasing resources.
//! - Loading is deterministic: the same on-disk state hydrates a CRDT to the
//!   same logical value regardless of insert order since load.
//!
//! Known backends: SQLite (native and worker-hosted), memory (testing), and
//! an encrypting wrapper around an inner adapter. The SQL-backed ones also
//! expose a [`MigrationDatabase`] for the schema migration engine.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

use crate::prelude::*;

/// Locally cached snapshot blob for one document scope.
#[derive(Debug, Clone)]
pub struct CachedSnapshot {
	pub bytes: Vec<u8>,
	pub vector: Vec<u8>,
	pub seq: u64,
}

/// Everything persisted for one document scope, deltas in insertion order.
#[derive(Debug, Clone, Default)]
pub struct DocLoad {
	pub snapshot: Option<CachedSnapshot>,
	pub deltas: Vec<Vec<u8>>,
}

impl DocLoad {
	pub fn is_empty(&self) -> bool {
		self.snapshot.is_none() && self.deltas.is_empty()
	}
}

#[async_trait]
pub trait CacheAdapter: Send + Sync + Debug {
	/// Read the snapshot (if any) and all deltas for a scope.
	async fn load_document(&self, scope: &str) -> DsResult<DocLoad>;

	/// Append one delta blob to the scope's ordered delta sequence.
	async fn append_delta(&self, scope: &str, bytes: &[u8]) -> DsResult<()>;

	/// Replace the scope's snapshot and drop the deltas it absorbs (all
	/// deltas persisted before this call).
	async fn put_snapshot(&self, scope: &str, snapshot: &CachedSnapshot) -> DsResult<()>;

	/// Remove everything stored for one scope.
	async fn remove_document(&self, scope: &str) -> DsResult<()>;

	/// Document ids persisted under a "collection:" prefix (prefix stripped).
	async fn list_documents(&self, prefix: &str) -> DsResult<Vec<Box<str>>>;

	/// Drop all snapshots and deltas under a prefix. Used by migration reset;
	/// kv keys are the caller's responsibility.
	async fn clear_documents(&self, prefix: &str) -> DsResult<()>;

	// JSON-serializable key-value access
	//***********************************

	async fn kv_get(&self, key: &str) -> DsResult<Option<Value>>;
	async fn kv_set(&self, key: &str, value: &Value) -> DsResult<()>;
	async fn kv_del(&self, key: &str) -> DsResult<()>;

	/// Drain pending writes. Default is synchronous-adapter no-op.
	async fn flush(&self) -> DsResult<()> {
		Ok(())
	}

	/// Drain pending writes, then release resources.
	async fn close(&self) -> DsResult<()>;

	/// SQL access for the migration engine; None for non-SQL backends.
	fn migration_db(&self) -> Option<Arc<dyn MigrationDatabase>> {
		None
	}
}

/// Minimal SQL surface the migration engine runs against. Rows travel as
/// JSON objects keyed by column name.
#[async_trait]
pub trait MigrationDatabase: Send + Sync {
	/// Execute one parameterized statement, returning affected-row count.
	async fn run(&self, sql: &str, params: &[Value]) -> DsResult<u64>;

	/// Execute a statement batch (DDL).
	async fn exec(&self, sql: &str) -> DsResult<()>;

	/// First result row, if any.
	async fn get(&self, sql: &str, params: &[Value]) -> DsResult<Option<Value>>;

	/// All result rows.
	async fn all(&self, sql: &str, params: &[Value]) -> DsResult<Vec<Value>>;
}

/// Well-known kv keys.
pub mod kv_keys {
	/// Last seq applied from the server stream for a collection
	pub fn cursor(collection: &str) -> String {
		format!("cursor:{}", collection)
	}

	/// Persisted offline write queue for a collection
	pub fn queue(collection: &str) -> String {
		format!("queue:{}", collection)
	}

	/// Stable device identifier
	pub const CLIENT_ID: &str = "clientId";
}

// vim: ts=4
