//! Shared helpers for client integration tests: an in-process server engine
//! and a transport wrapper that can simulate going offline.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use driftsync_client::schema::{FieldDescriptor, FieldKind, VersionedSchema};
use driftsync_log_adapter_sqlite::LogAdapterSqlite;
use driftsync_server::Engine;
use driftsync_types::api::{
	ChangeFeed, DocumentState, PresenceAction, PresenceUpdate, RecoveryReply, SessionInfo,
	StreamBatch, SyncApi, WriteHints, WriteOutcome,
};
use driftsync_types::error::{DsResult, Error};
use driftsync_types::types::CollectionConfig;

pub async fn server() -> (Arc<Engine>, TempDir) {
	server_with(CollectionConfig::default()).await
}

pub async fn server_with(config: CollectionConfig) -> (Arc<Engine>, TempDir) {
	let temp = TempDir::new().expect("temp dir");
	let store = Arc::new(LogAdapterSqlite::new(temp.path()).await.expect("log adapter"));
	(Engine::with_compactor_backoff(store, config, 1), temp)
}

pub fn task_schema() -> VersionedSchema {
	VersionedSchema::new(
		"tasks",
		1,
		vec![
			FieldDescriptor::new("title", FieldKind::String),
			FieldDescriptor::new("done", FieldKind::Boolean).optional(),
			FieldDescriptor::new("notes", FieldKind::Prose).optional(),
		],
	)
}

/// Fast client config so retry budgets drain in test time.
pub fn client_config() -> CollectionConfig {
	CollectionConfig { prose_debounce_ms: 20, ..CollectionConfig::default() }
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_until<F>(what: &str, mut check: F)
where
	F: FnMut() -> bool,
{
	let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
	loop {
		if check() {
			return;
		}
		assert!(std::time::Instant::now() < deadline, "timed out waiting for {}", what);
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
	}
}

/// Poll an async condition until it passes or the timeout elapses.
pub async fn wait_until_async<F, Fut>(what: &str, mut check: F)
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
	loop {
		if check().await {
			return;
		}
		assert!(std::time::Instant::now() < deadline, "timed out waiting for {}", what);
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
	}
}

/// SyncApi wrapper that fails calls with a transient network error while
/// offline. The change feed stays subscribed, mirroring a dropped link that
/// the host environment later restores.
pub struct FlakyApi {
	inner: Arc<Engine>,
	offline: AtomicBool,
}

impl FlakyApi {
	pub fn new(inner: Arc<Engine>) -> Arc<Self> {
		Arc::new(Self { inner, offline: AtomicBool::new(false) })
	}

	pub fn set_offline(&self, offline: bool) {
		self.offline.store(offline, Ordering::SeqCst);
	}

	fn check(&self) -> DsResult<()> {
		if self.offline.load(Ordering::SeqCst) {
			Err(Error::Network("link down".into()))
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl SyncApi for FlakyApi {
	async fn insert_document(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		hints: WriteHints,
	) -> DsResult<WriteOutcome> {
		self.check()?;
		self.inner.insert_document(collection, document, bytes, hints).await
	}

	async fn update_document(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		hints: WriteHints,
	) -> DsResult<WriteOutcome> {
		self.check()?;
		self.inner.update_document(collection, document, bytes, hints).await
	}

	async fn delete_document(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		hints: WriteHints,
	) -> DsResult<WriteOutcome> {
		self.check()?;
		self.inner.delete_document(collection, document, bytes, hints).await
	}

	async fn stream(
		&self,
		collection: &str,
		cursor: u64,
		limit: Option<u32>,
	) -> DsResult<StreamBatch> {
		self.check()?;
		self.inner.stream(collection, cursor, limit).await
	}

	async fn recovery(
		&self,
		collection: &str,
		document: &str,
		vector: Option<&[u8]>,
	) -> DsResult<RecoveryReply> {
		self.check()?;
		self.inner.recovery(collection, document, vector).await
	}

	async fn document_state(
		&self,
		collection: &str,
		document: &str,
	) -> DsResult<Option<DocumentState>> {
		self.check()?;
		self.inner.document_state(collection, document).await
	}

	async fn subscribe(&self, collection: &str) -> DsResult<ChangeFeed> {
		self.inner.subscribe(collection).await
	}

	async fn presence(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		action: PresenceAction,
		update: PresenceUpdate,
	) -> DsResult<()> {
		self.check()?;
		self.inner.presence(collection, document, client, action, update).await
	}

	async fn mark(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		seq: Option<u64>,
		vector: Option<Vec<u8>>,
	) -> DsResult<()> {
		self.check()?;
		self.inner.mark(collection, document, client, seq, vector).await
	}

	async fn sessions(
		&self,
		collection: &str,
		document: &str,
		connected: Option<bool>,
		exclude: Option<&str>,
	) -> DsResult<Vec<SessionInfo>> {
		self.check()?;
		self.inner.sessions(collection, document, connected, exclude).await
	}
}

// vim: ts=4
