//! Engine: the server operation surface.
//!
//! One value per deployment tying the log, the session registry and the
//! compactor to a shared [`LogStore`]. Implements
//! [`driftsync_types::api::SyncApi`], the contract transports and in-process
//! clients program against.

use async_trait::async_trait;
use std::sync::Arc;

use crate::compactor::{Compactor, StepOutcome};
use crate::log::ServerLog;
use crate::prelude::*;
use crate::sessions::SessionRegistry;
use driftsync_types::api::{
	ChangeFeed, DocumentState, PresenceAction, PresenceUpdate, RecoveryReply, SessionInfo,
	StreamBatch, SyncApi, WriteHints, WriteOutcome,
};
use driftsync_types::log_store::{CompactionRow, LogStore};

pub struct Engine {
	config: CollectionConfig,
	log: ServerLog,
	sessions: SessionRegistry,
	compactor: Arc<Compactor>,
	store: Arc<dyn LogStore>,
}

impl Engine {
	pub fn new(store: Arc<dyn LogStore>, config: CollectionConfig) -> Arc<Self> {
		Self::with_compactor_backoff(store, config, 1_000)
	}

	/// Tests shrink the compaction failure backoff through this constructor.
	pub fn with_compactor_backoff(
		store: Arc<dyn LogStore>,
		config: CollectionConfig,
		backoff_base_ms: u64,
	) -> Arc<Self> {
		let log = ServerLog::new(Arc::clone(&store));
		let sessions = SessionRegistry::new(Arc::clone(&store), config.presence_interval_secs);
		let compactor =
			Arc::new(Compactor::new(Arc::clone(&store)).with_backoff_base(backoff_base_ms));
		Arc::new(Self { config, log, sessions, compactor, store })
	}

	pub fn log(&self) -> &ServerLog {
		&self.log
	}

	pub fn session_registry(&self) -> &SessionRegistry {
		&self.sessions
	}

	pub fn config(&self) -> &CollectionConfig {
		&self.config
	}

	/// Shared write path: append the delta, then schedule compaction once
	/// the document's chain crosses the threshold.
	async fn write(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		exists: bool,
		hints: WriteHints,
	) -> DsResult<WriteOutcome> {
		let result = self.log.append(collection, document, bytes, exists).await?;
		let threshold = u64::from(hints.threshold.unwrap_or(self.config.threshold));
		if result.count >= threshold {
			self.schedule_compaction(collection, document, hints).await?;
		}
		Ok(WriteOutcome { seq: result.seq })
	}

	/// Enqueue a compaction job (at-most-one pending) and run it detached.
	pub async fn schedule_compaction(
		&self,
		collection: &str,
		document: &str,
		hints: WriteHints,
	) -> DsResult<bool> {
		let timeout = hints.timeout_secs.unwrap_or(self.config.session_timeout_secs);
		let retain = hints.retain.unwrap_or(self.config.retain);
		let scheduled = self.compactor.schedule(collection, document, timeout, retain).await?;
		if scheduled {
			let compactor = Arc::clone(&self.compactor);
			let (c, d) = (collection.to_owned(), document.to_owned());
			tokio::spawn(async move {
				if let Err(e) = compactor.run(&c, &d).await {
					error!("background compaction of {}/{} failed: {}", c, d, e);
				}
			});
		}
		Ok(scheduled)
	}

	/// Drive one bounded step of the document's job. Operator control plane.
	pub async fn run_compaction(&self, collection: &str, document: &str) -> DsResult<StepOutcome> {
		self.compactor.step(collection, document).await
	}

	/// Schedule (if no job is queued) and drive the document's job to
	/// completion synchronously. Used by tests and operator tooling.
	pub async fn compact(&self, collection: &str, document: &str) -> DsResult<()> {
		self.compactor
			.schedule(
				collection,
				document,
				self.config.session_timeout_secs,
				self.config.retain,
			)
			.await?;
		self.compactor.run(collection, document).await
	}

	pub async fn compaction_status(
		&self,
		collection: &str,
		document: &str,
	) -> DsResult<Option<CompactionRow>> {
		self.store.job(collection, document).await
	}
}

#[async_trait]
impl SyncApi for Engine {
	async fn insert_document(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		hints: WriteHints,
	) -> DsResult<WriteOutcome> {
		self.write(collection, document, bytes, true, hints).await
	}

	async fn update_document(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		hints: WriteHints,
	) -> DsResult<WriteOutcome> {
		self.write(collection, document, bytes, true, hints).await
	}

	async fn delete_document(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		hints: WriteHints,
	) -> DsResult<WriteOutcome> {
		self.write(collection, document, bytes, false, hints).await
	}

	async fn stream(
		&self,
		collection: &str,
		cursor: u64,
		limit: Option<u32>,
	) -> DsResult<StreamBatch> {
		self.log.stream(collection, cursor, limit).await
	}

	async fn recovery(
		&self,
		collection: &str,
		document: &str,
		vector: Option<&[u8]>,
	) -> DsResult<RecoveryReply> {
		let (diff, vector) = self.log.recovery(collection, document, vector).await?;
		Ok(RecoveryReply { diff, vector })
	}

	async fn document_state(
		&self,
		collection: &str,
		document: &str,
	) -> DsResult<Option<DocumentState>> {
		Ok(self
			.log
			.reconstruct(collection, document)
			.await?
			.map(|(bytes, seq)| DocumentState { bytes, seq }))
	}

	async fn subscribe(&self, collection: &str) -> DsResult<ChangeFeed> {
		Ok(self.log.subscribe(collection))
	}

	async fn presence(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		action: PresenceAction,
		update: PresenceUpdate,
	) -> DsResult<()> {
		match action {
			PresenceAction::Join => self.sessions.join(collection, document, client, update).await,
			PresenceAction::Leave => self.sessions.leave(collection, document, client).await,
		}
	}

	async fn mark(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		seq: Option<u64>,
		vector: Option<Vec<u8>>,
	) -> DsResult<()> {
		self.sessions.mark(collection, document, client, seq, vector).await
	}

	async fn sessions(
		&self,
		collection: &str,
		document: &str,
		connected: Option<bool>,
		exclude: Option<&str>,
	) -> DsResult<Vec<SessionInfo>> {
		self.sessions.sessions(collection, document, connected, exclude).await
	}
}

impl std::fmt::Debug for Engine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Engine").field("config", &self.config).finish()
	}
}

// vim: ts=4
