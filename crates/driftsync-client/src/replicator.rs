//! Client replication state machine.
//!
//! Keeps the in-memory documents, the durable cache and the materialized
//! view consistent with the server stream. On startup it hydrates every
//! cached document, repairs missed bytes through recovery, drains the
//! persisted offline write queue, then follows the change stream from the
//! stored cursor. Local edits apply synchronously to the CRDT (the view is
//! immediately consistent) and upload with a bounded retry budget; what the
//! server has not acknowledged stays queued for the next reconnect.

use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

use crate::docs::{ClientDocManager, ProseBinding};
use crate::prelude::*;
use crate::schema::VersionedSchema;
use crate::view::MaterializedView;
use driftsync_types::api::{StreamBatch, SyncApi, WriteHints};
use driftsync_types::cache_adapter::{kv_keys, CacheAdapter};
use driftsync_types::crdt;
use driftsync_types::utils::random_id;

const STREAM_LIMIT: u32 = 100;
const STREAM_RETRY_MS: u64 = 500;
const UPLOAD_BACKOFF_MS: u64 = 100;

/// Which write mutation a queued change maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
	Insert,
	Update,
	Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntry {
	document: Box<str>,
	op: WriteOp,
}

pub struct Replicator {
	/// Self-handle for detached tasks and observer callbacks
	weak: Weak<Replicator>,
	collection: Box<str>,
	api: Arc<dyn SyncApi>,
	adapter: Arc<dyn CacheAdapter>,
	docs: Arc<ClientDocManager>,
	view: Arc<MaterializedView>,
	config: CollectionConfig,
	client_id: std::sync::OnceLock<Box<str>>,
	cursor: AtomicU64,
	ready: AtomicBool,
	/// Documents with local changes the server has not acknowledged
	queue: tokio::sync::Mutex<Vec<QueueEntry>>,
	/// Documents with an armed prose debounce timer
	prose_pending: DashMap<Box<str>, ()>,
	errors_tx: flume::Sender<Error>,
	errors_rx: flume::Receiver<Error>,
	stream_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Replicator {
	pub fn new(
		api: Arc<dyn SyncApi>,
		adapter: Arc<dyn CacheAdapter>,
		schema: &VersionedSchema,
		config: CollectionConfig,
	) -> Arc<Self> {
		let docs = Arc::new(ClientDocManager::new(
			schema.collection.clone(),
			schema.field_names(),
			schema.prose_fields(),
			Some(Arc::clone(&adapter)),
		));
		let (errors_tx, errors_rx) = flume::unbounded();
		Arc::new_cyclic(|weak| Self {
			weak: weak.clone(),
			collection: schema.collection.clone(),
			api,
			adapter,
			docs,
			view: Arc::new(MaterializedView::new()),
			config,
			client_id: std::sync::OnceLock::new(),
			cursor: AtomicU64::new(0),
			ready: AtomicBool::new(false),
			queue: tokio::sync::Mutex::new(Vec::new()),
			prose_pending: DashMap::new(),
			errors_tx,
			errors_rx,
			stream_task: tokio::sync::Mutex::new(None),
		})
	}

	pub fn collection(&self) -> &str {
		&self.collection
	}

	pub fn view(&self) -> &Arc<MaterializedView> {
		&self.view
	}

	pub fn docs(&self) -> &Arc<ClientDocManager> {
		&self.docs
	}

	pub fn cursor(&self) -> u64 {
		self.cursor.load(Ordering::SeqCst)
	}

	pub fn client_id(&self) -> Option<&str> {
		self.client_id.get().map(AsRef::as_ref)
	}

	/// Dead-subscription and reconciliation failures surface here.
	pub fn errors(&self) -> flume::Receiver<Error> {
		self.errors_rx.clone()
	}

	fn ensure_ready(&self) -> DsResult<()> {
		if self.ready.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(Error::CollectionNotReady)
		}
	}

	fn surface(&self, error: Error) {
		warn!("{}: surfaced error: {}", self.collection, error);
		let _ = self.errors_tx.send(error);
	}

	/// Hydrate, recover, materialize, then follow the stream.
	pub async fn start(&self) -> DsResult<()> {
		// 1. Hydrate every cached document; get_or_create waits for the
		//    provider's synced point
		let prefix = format!("{}:", self.collection);
		let ids = self.adapter.list_documents(&prefix).await?;
		for id in &ids {
			self.docs.get_or_create(id).await?;
		}

		// 2. Stable device identifier
		let client_id: Box<str> = match self.adapter.kv_get(kv_keys::CLIENT_ID).await? {
			Some(Value::String(id)) => id.into(),
			_ => {
				let id = random_id()?;
				self.adapter.kv_set(kv_keys::CLIENT_ID, &json!(id)).await?;
				id.into()
			}
		};
		let _ = self.client_id.set(client_id);

		// 3. Cursor; a cursor with no hydrated state is stale
		let cursor_key = kv_keys::cursor(&self.collection);
		let mut cursor = self
			.adapter
			.kv_get(&cursor_key)
			.await?
			.and_then(|v| v.as_u64())
			.unwrap_or(0);
		if cursor > 0 && ids.is_empty() {
			warn!("{}: stale cursor {} without local state, resetting", self.collection, cursor);
			cursor = 0;
			self.adapter.kv_set(&cursor_key, &json!(0)).await?;
		}
		self.cursor.store(cursor, Ordering::SeqCst);

		// 4. Load the offline queue, then repair every document against the
		//    server and drain what the server is missing
		*self.queue.lock().await = self.load_queue().await?;
		self.recover_all().await?;

		// 5. Materialize the application view
		let mut items = Vec::new();
		for id in self.docs.documents()? {
			if let Some(item) = self.docs.materialize(&id)? {
				items.push(item);
			}
		}
		self.view.replace(items)?;

		// 6. Follow the stream
		self.ready.store(true, Ordering::SeqCst);
		self.restart_stream().await;
		info!("{}: replication started at cursor {}", self.collection, self.cursor());
		Ok(())
	}

	/// (Re)spawn the stream follower; used at startup and after the caller
	/// was told the previous subscription died.
	pub async fn restart_stream(&self) {
		let Some(rep) = self.weak.upgrade() else { return };
		let mut slot = self.stream_task.lock().await;
		if let Some(task) = slot.take() {
			task.abort();
		}
		*slot = Some(tokio::spawn(async move { rep.run_stream().await }));
	}

	async fn run_stream(self: Arc<Self>) {
		let mut feed = match self.api.subscribe(&self.collection).await {
			Ok(feed) => feed,
			Err(e) => {
				self.surface(e);
				return;
			}
		};
		loop {
			let cursor = self.cursor();
			match self.api.stream(&self.collection, cursor, Some(STREAM_LIMIT)).await {
				Ok(batch) => {
					let more = batch.more;
					if !batch.changes.is_empty() || batch.seq > cursor {
						if let Err(e) = self.apply_batch(batch).await {
							self.surface(e);
							return;
						}
					}
					if more {
						continue;
					}
					// Idle until the head moves
					if feed.next().await.is_none() {
						debug!("{}: change feed closed", self.collection);
						return;
					}
				}
				Err(e) if e.is_retriable() => {
					trace!("{}: stream retry after: {}", self.collection, e);
					tokio::time::sleep(std::time::Duration::from_millis(STREAM_RETRY_MS)).await;
				}
				Err(e) => {
					// MissingBaseline and friends kill the subscription
					self.surface(e);
					return;
				}
			}
		}
	}

	/// Apply one stream batch: deltas and snapshots both merge into the
	/// local doc (a snapshot is an authoritative resync), then the cursor
	/// advances and progress is reported best-effort.
	pub async fn apply_batch(&self, batch: StreamBatch) -> DsResult<()> {
		let mut touched: BTreeSet<Box<str>> = BTreeSet::new();
		for change in &batch.changes {
			self.docs.apply_update(&change.document, &change.bytes, Origin::Server).await?;
			let deleted = !change.exists || self.docs.is_deleted(&change.document)?;
			if deleted {
				self.view.remove(&change.document)?;
			} else if let Some(item) = self.docs.materialize(&change.document)? {
				self.view.upsert(item)?;
			}
			touched.insert(change.document.clone());
		}

		if batch.seq > self.cursor() {
			self.set_cursor(batch.seq).await?;
		}
		self.adapter
			.kv_set(&format!("lastSync:{}", self.collection), &json!(Timestamp::now().0))
			.await?;

		for document in touched {
			self.mark_progress(&document, Some(batch.seq)).await;
		}
		Ok(())
	}

	async fn set_cursor(&self, seq: u64) -> DsResult<()> {
		self.cursor.store(seq, Ordering::SeqCst);
		self.adapter.kv_set(&kv_keys::cursor(&self.collection), &json!(seq)).await
	}

	/// Best-effort `mark`: sync progress reporting never fails a caller.
	async fn mark_progress(&self, document: &str, seq: Option<u64>) {
		let Some(client) = self.client_id() else { return };
		let vector = self.docs.encode_state_vector(document).ok();
		if let Err(e) = self.api.mark(&self.collection, document, client, seq, vector).await {
			trace!("mark for {} failed: {}", document, e);
		}
	}

	// Local edits
	//*************

	/// Insert new documents: fields are written into fresh CRDT documents
	/// (prose fields materialize as fragments) and the deltas replicate.
	pub async fn insert(&self, items: Vec<(String, Map<String, Value>)>) -> DsResult<()> {
		self.ensure_ready()?;
		for (id, fields) in items {
			let delta = self.docs.insert_fields(&id, &fields).await?;
			if let Some(item) = self.docs.materialize(&id)? {
				self.view.upsert(item)?;
			}
			self.replicate(&id, WriteOp::Insert, &delta).await?;
		}
		Ok(())
	}

	/// Update existing documents; prose fields flow through their fragment
	/// observers instead of the JSON path.
	pub async fn update(&self, items: Vec<(String, Map<String, Value>)>) -> DsResult<()> {
		self.ensure_ready()?;
		for (id, fields) in items {
			let delta = self.docs.update_fields(&id, &fields).await?;
			if let Some(item) = self.docs.materialize(&id)? {
				self.view.upsert(item)?;
			}
			self.replicate(&id, WriteOp::Update, &delta).await?;
		}
		Ok(())
	}

	/// Apply the delete marker and replicate it as a tombstone write.
	pub async fn delete(&self, ids: Vec<String>) -> DsResult<()> {
		self.ensure_ready()?;
		for id in ids {
			let delta = self.docs.mark_deleted(&id).await?;
			self.view.remove(&id)?;
			self.replicate(&id, WriteOp::Delete, &delta).await?;
		}
		Ok(())
	}

	/// Queue the change, then try to upload it. Transient failures leave it
	/// queued for the next reconnect; non-retriable failures surface.
	async fn replicate(&self, document: &str, op: WriteOp, delta: &[u8]) -> DsResult<()> {
		// An update touching only prose fields produces no JSON-path delta
		if crdt::is_empty_update(delta) {
			return Ok(());
		}
		self.enqueue(document, op).await?;
		match self.upload(document, op, delta).await {
			Ok(seq) => {
				self.dequeue(document).await?;
				self.mark_progress(document, Some(seq)).await;
				Ok(())
			}
			Err(e) if e.is_retriable() => {
				debug!("{}: upload of {} deferred: {}", self.collection, document, e);
				Ok(())
			}
			Err(e) => {
				self.dequeue(document).await?;
				Err(e)
			}
		}
	}

	/// Single upload with the bounded linear-backoff retry budget.
	async fn upload(&self, document: &str, op: WriteOp, bytes: &[u8]) -> DsResult<u64> {
		let hints = WriteHints::default();
		let mut attempt: u32 = 0;
		loop {
			let result = match op {
				WriteOp::Insert => {
					self.api.insert_document(&self.collection, document, bytes, hints).await
				}
				WriteOp::Update => {
					self.api.update_document(&self.collection, document, bytes, hints).await
				}
				WriteOp::Delete => {
					self.api.delete_document(&self.collection, document, bytes, hints).await
				}
			};
			match result {
				Ok(outcome) => return Ok(outcome.seq),
				Err(e) if e.is_retriable() && attempt < self.config.max_retries => {
					attempt += 1;
					tokio::time::sleep(std::time::Duration::from_millis(
						UPLOAD_BACKOFF_MS * u64::from(attempt),
					))
					.await;
				}
				Err(e) => return Err(e),
			}
		}
	}

	// Recovery & reconnection
	//*************************

	/// Repair every resident document against the server: apply the server's
	/// diff, then upload local state the server has no equivalent of —
	/// exactly once per document.
	async fn recover_all(&self) -> DsResult<()> {
		let queued: HashMap<Box<str>, WriteOp> = self
			.queue
			.lock()
			.await
			.iter()
			.map(|e| (e.document.clone(), e.op))
			.collect();

		for document in self.docs.documents()? {
			let op = queued.get(&document).copied().unwrap_or(WriteOp::Update);
			match self.sync_document(&document, op).await {
				Ok(_uploaded) => self.dequeue(&document).await?,
				Err(e) if e.is_retriable() => {
					warn!("{}: recovery of {} deferred: {}", self.collection, document, e);
				}
				Err(e) => return Err(e),
			}
		}
		Ok(())
	}

	/// One recovery round-trip for one document.
	async fn sync_document(&self, document: &str, op: WriteOp) -> DsResult<bool> {
		let vector = self.docs.encode_state_vector(document)?;
		let reply = self.api.recovery(&self.collection, document, Some(&vector)).await?;
		if let Some(diff) = &reply.diff {
			if !crdt::is_empty_update(diff) {
				self.docs.apply_update(document, diff, Origin::Server).await?;
			}
		}

		let local = self.docs.diff_against(document, &reply.vector)?;
		if crdt::is_empty_update(&local) {
			return Ok(false);
		}
		let seq = self.upload(document, op, &local).await?;
		self.mark_progress(document, Some(seq)).await;
		Ok(true)
	}

	/// Host signal: network restored. Re-runs recovery for all documents.
	pub async fn reconnect(&self) -> DsResult<()> {
		self.ensure_ready()?;
		info!("{}: reconnecting", self.collection);
		self.recover_all().await
	}

	// Prose sync
	//************

	/// Vend an editor binding whose fragment edits arm the debounced upload.
	pub async fn bind_prose(&self, document: &str, field: &str) -> DsResult<ProseBinding> {
		let weak = self.weak.clone();
		self.docs
			.bind_fragment(
				document,
				field,
				Box::new(move |doc| {
					if let Some(rep) = weak.upgrade() {
						rep.queue_prose(doc);
					}
				}),
			)
			.await
	}

	/// Coalesce fragment edits: the first edit arms a timer; when it fires
	/// the full current state uploads as one update. On retry exhaustion the
	/// pending flag clears so the next edit re-arms.
	pub fn queue_prose(&self, document: &str) {
		if self.prose_pending.insert(document.into(), ()).is_some() {
			return;
		}
		let Some(rep) = self.weak.upgrade() else { return };
		let document: Box<str> = document.into();
		tokio::spawn(async move {
			tokio::time::sleep(std::time::Duration::from_millis(rep.config.prose_debounce_ms))
				.await;
			let result = async {
				let state = rep.docs.encode_state(&document)?;
				let seq = rep.upload(&document, WriteOp::Update, &state).await?;
				rep.mark_progress(&document, Some(seq)).await;
				DsResult::Ok(())
			}
			.await;
			rep.prose_pending.remove(&document);
			if let Err(e) = result {
				warn!("prose sync for {} gave up: {}", document, e);
			}
		});
	}

	// Offline queue
	//***************

	async fn load_queue(&self) -> DsResult<Vec<QueueEntry>> {
		let value = self.adapter.kv_get(&kv_keys::queue(&self.collection)).await?;
		Ok(value.and_then(|v| serde_json::from_value(v).ok()).unwrap_or_default())
	}

	async fn persist_queue(&self, queue: &[QueueEntry]) -> DsResult<()> {
		self.adapter
			.kv_set(&kv_keys::queue(&self.collection), &serde_json::to_value(queue)?)
			.await
	}

	async fn enqueue(&self, document: &str, op: WriteOp) -> DsResult<()> {
		let mut queue = self.queue.lock().await;
		match queue.iter_mut().find(|e| e.document.as_ref() == document) {
			Some(entry) => {
				// A later delete supersedes; an insert stays an insert
				if op == WriteOp::Delete {
					entry.op = WriteOp::Delete;
				}
			}
			None => queue.push(QueueEntry { document: document.into(), op }),
		}
		self.persist_queue(&queue).await
	}

	async fn dequeue(&self, document: &str) -> DsResult<()> {
		let mut queue = self.queue.lock().await;
		let before = queue.len();
		queue.retain(|e| e.document.as_ref() != document);
		if queue.len() != before {
			self.persist_queue(&queue).await?;
		}
		Ok(())
	}

	/// Locally queued writes the server has not acknowledged.
	pub async fn pending_changes(&self) -> usize {
		self.queue.lock().await.len()
	}

	/// Tear down: stop the stream follower, drain providers, close the cache.
	pub async fn close(&self) -> DsResult<()> {
		self.ready.store(false, Ordering::SeqCst);
		if let Some(task) = self.stream_task.lock().await.take() {
			task.abort();
		}
		self.docs.close().await?;
		self.adapter.close().await?;
		info!("{}: replication closed", self.collection);
		Ok(())
	}
}

impl std::fmt::Debug for Replicator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Replicator")
			.field("collection", &self.collection)
			.field("cursor", &self.cursor.load(Ordering::Relaxed))
			.finish()
	}
}

// vim: ts=4
