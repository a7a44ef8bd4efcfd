//! In-memory CRDT document manager.
//!
//! Owns the collection's yrs documents and translates between application
//! mutations and opaque deltas. Typed fields live as JSON-encoded registers
//! in a root `fields` map (last-writer-wins per field); prose fields are
//! root XML fragments named `prose:{field}`; the delete marker lives in the
//! root `_meta` map. Every transaction carries an [`Origin`] tag so the
//! apply paths can suppress echoes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
	Any, Doc, GetString, Map as YMap, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut,
	Update, WriteTxn, XmlFragment, XmlFragmentRef, XmlTextPrelim,
};

use crate::persistence::DocPersistence;
use crate::prelude::*;
use crate::view::DocView;
use driftsync_types::cache_adapter::CacheAdapter;
use driftsync_types::utils::doc_scope;

const DELETED_KEY: &str = "_deleted";
const DELETED_AT_KEY: &str = "_deletedAt";

/// One resident document: the CRDT doc plus its root handles and optional
/// storage provider.
pub struct DocEntry {
	document: Box<str>,
	doc: Doc,
	fields: MapRef,
	meta: MapRef,
	provider: tokio::sync::Mutex<Option<DocPersistence>>,
}

impl DocEntry {
	pub fn document(&self) -> &str {
		&self.document
	}

	pub fn doc(&self) -> &Doc {
		&self.doc
	}
}

/// Apply an opaque update under an origin tag.
pub(crate) fn apply_with_origin(doc: &Doc, bytes: &[u8], origin: Origin) -> DsResult<()> {
	let update = Update::decode_v1(bytes)
		.map_err(|e| Error::Reconciliation(format!("undecodable update: {}", e)))?;
	let mut txn = doc.transact_mut_with(origin);
	txn.apply_update(update)
		.map_err(|e| Error::Reconciliation(format!("update apply failed: {}", e)))?;
	Ok(())
}

fn read_json(map: &MapRef, txn: &impl ReadTxn, key: &str) -> Option<Value> {
	match map.get(txn, key) {
		Some(Out::Any(Any::String(s))) => serde_json::from_str(s.as_ref()).ok(),
		_ => None,
	}
}

/// Editor-facing capability object for one prose field. The manager owns the
/// document lifetime; the binding holds the fragment handle, the document id,
/// and a pending-edit observer. Dropping it is the destroy hook.
impl std::fmt::Debug for ProseBinding {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProseBinding")
			.field("document", &self.document)
			.field("doc", &self.doc)
			.field("fragment", &self.fragment)
			.finish_non_exhaustive()
	}
}

pub struct ProseBinding {
	document: Box<str>,
	doc: Doc,
	fragment: XmlFragmentRef,
	_pending_sub: yrs::Subscription,
}

impl ProseBinding {
	pub fn document(&self) -> &str {
		&self.document
	}

	pub fn fragment(&self) -> &XmlFragmentRef {
		&self.fragment
	}

	/// Run an editor mutation inside a fragment-tagged transaction.
	pub fn transact<F>(&self, f: F) -> DsResult<()>
	where
		F: FnOnce(&XmlFragmentRef, &mut TransactionMut<'_>) -> DsResult<()>,
	{
		let mut txn = self.doc.transact_mut_with(Origin::Fragment);
		f(&self.fragment, &mut txn)
	}

	pub fn text(&self) -> String {
		let txn = self.doc.transact();
		self.fragment.get_string(&txn)
	}
}

pub struct ClientDocManager {
	collection: Box<str>,
	/// Field names of the collection schema, in declaration order
	schema_fields: Vec<Box<str>>,
	prose_fields: HashSet<Box<str>>,
	adapter: Option<Arc<dyn CacheAdapter>>,
	docs: RwLock<HashMap<Box<str>, Arc<DocEntry>>>,
	/// Serializes document creation so providers attach exactly once
	create_lock: tokio::sync::Mutex<()>,
}

impl ClientDocManager {
	pub fn new(
		collection: impl Into<Box<str>>,
		schema_fields: Vec<Box<str>>,
		prose_fields: HashSet<Box<str>>,
		adapter: Option<Arc<dyn CacheAdapter>>,
	) -> Self {
		Self {
			collection: collection.into(),
			schema_fields,
			prose_fields,
			adapter,
			docs: RwLock::new(HashMap::new()),
			create_lock: tokio::sync::Mutex::new(()),
		}
	}

	pub fn collection(&self) -> &str {
		&self.collection
	}

	pub fn is_prose(&self, field: &str) -> bool {
		self.prose_fields.contains(field)
	}

	fn docs_read(
		&self,
	) -> DsResult<std::sync::RwLockReadGuard<'_, HashMap<Box<str>, Arc<DocEntry>>>> {
		self.docs.read().map_err(|_| Error::Internal("doc map poisoned".into()))
	}

	fn docs_write(
		&self,
	) -> DsResult<std::sync::RwLockWriteGuard<'_, HashMap<Box<str>, Arc<DocEntry>>>> {
		self.docs.write().map_err(|_| Error::Internal("doc map poisoned".into()))
	}

	pub fn entry(&self, document: &str) -> DsResult<Option<Arc<DocEntry>>> {
		Ok(self.docs_read()?.get(document).cloned())
	}

	pub fn contains(&self, document: &str) -> DsResult<bool> {
		Ok(self.docs_read()?.contains_key(document))
	}

	pub fn documents(&self) -> DsResult<Vec<Box<str>>> {
		let mut ids: Vec<Box<str>> = self.docs_read()?.keys().cloned().collect();
		ids.sort();
		Ok(ids)
	}

	/// Resident document for `document`, created on first use. With
	/// persistence enabled the new document is hydrated from the cache and
	/// its provider attached before the handle is returned, so later changes
	/// are durable.
	pub async fn get_or_create(&self, document: &str) -> DsResult<Arc<DocEntry>> {
		if let Some(entry) = self.entry(document)? {
			return Ok(entry);
		}
		let _guard = self.create_lock.lock().await;
		if let Some(entry) = self.entry(document)? {
			return Ok(entry);
		}

		let doc = Doc::new();
		let fields = doc.get_or_insert_map("fields");
		let meta = doc.get_or_insert_map("_meta");
		let entry = Arc::new(DocEntry {
			document: document.into(),
			doc,
			fields,
			meta,
			provider: tokio::sync::Mutex::new(None),
		});

		if let Some(adapter) = &self.adapter {
			let scope = doc_scope(&self.collection, document);
			let provider =
				DocPersistence::attach(Arc::clone(adapter), &scope, &entry.doc).await?;
			*entry.provider.lock().await = Some(provider);
		}

		self.docs_write()?.insert(document.into(), Arc::clone(&entry));
		trace!("created doc {}:{}", self.collection, document);
		Ok(entry)
	}

	pub async fn apply_update(
		&self,
		document: &str,
		bytes: &[u8],
		origin: Origin,
	) -> DsResult<()> {
		let entry = self.get_or_create(document).await?;
		apply_with_origin(&entry.doc, bytes, origin)
	}

	/// Run `f` inside an origin-tagged transaction and return a delta
	/// encoding just the change, computed against the pre-transaction state
	/// vector. This is the canonical producer of outbound bytes.
	pub async fn transact_with_delta<F>(
		&self,
		document: &str,
		origin: Origin,
		f: F,
	) -> DsResult<Vec<u8>>
	where
		F: FnOnce(&DocEntry, &mut TransactionMut<'_>) -> DsResult<()>,
	{
		let entry = self.get_or_create(document).await?;
		let before = {
			let txn = entry.doc.transact();
			txn.state_vector()
		};
		{
			let mut txn = entry.doc.transact_mut_with(origin);
			f(entry.as_ref(), &mut txn)?;
		}
		let txn = entry.doc.transact();
		Ok(txn.encode_state_as_update_v1(&before))
	}

	fn write_field(
		&self,
		entry: &DocEntry,
		txn: &mut TransactionMut<'_>,
		name: &str,
		value: &Value,
	) {
		if self.prose_fields.contains(name) {
			let content = match value {
				Value::String(s) => s.clone(),
				other => other.to_string(),
			};
			// Root registration must go through the live transaction
			let fragment = txn.get_or_insert_xml_fragment(format!("prose:{}", name).as_str());
			if !content.is_empty() {
				fragment.insert(txn, 0, XmlTextPrelim::new(content));
			}
		} else {
			entry.fields.insert(txn, name.to_owned(), value.to_string());
		}
	}

	/// Write all fields of a new document; prose fields are materialized as
	/// fresh fragments initialized from their JSON content.
	pub async fn insert_fields(&self, document: &str, fields: &Map<String, Value>) -> DsResult<Vec<u8>> {
		self.transact_with_delta(document, Origin::Local, |entry, txn| {
			for (name, value) in fields {
				self.write_field(entry, txn, name, value);
			}
			Ok(())
		})
		.await
	}

	/// Write changed fields of an existing document. Prose fields already
	/// resident as fragments are excluded from the JSON path; their edits
	/// flow through the fragment observer.
	pub async fn update_fields(&self, document: &str, fields: &Map<String, Value>) -> DsResult<Vec<u8>> {
		self.transact_with_delta(document, Origin::Local, |entry, txn| {
			for (name, value) in fields {
				if self.prose_fields.contains(name.as_str()) {
					continue;
				}
				self.write_field(entry, txn, name, value);
			}
			Ok(())
		})
		.await
	}

	/// Record the delete marker. The resulting delta travels as a normal
	/// write; applying it twice is a no-op at the logical level.
	pub async fn mark_deleted(&self, document: &str) -> DsResult<Vec<u8>> {
		self.transact_with_delta(document, Origin::Local, |entry, txn| {
			entry.meta.insert(txn, DELETED_KEY, "true".to_owned());
			entry.meta.insert(txn, DELETED_AT_KEY, Timestamp::now().0.to_string());
			Ok(())
		})
		.await
	}

	pub fn is_deleted(&self, document: &str) -> DsResult<bool> {
		let Some(entry) = self.entry(document)? else {
			return Ok(false);
		};
		let txn = entry.doc.transact();
		Ok(matches!(read_json(&entry.meta, &txn, DELETED_KEY), Some(Value::Bool(true))))
	}

	/// Project the document into its application view; None for unknown or
	/// logically deleted documents.
	pub fn materialize(&self, document: &str) -> DsResult<Option<DocView>> {
		let Some(entry) = self.entry(document)? else {
			return Ok(None);
		};
		let txn = entry.doc.transact();
		if matches!(read_json(&entry.meta, &txn, DELETED_KEY), Some(Value::Bool(true))) {
			return Ok(None);
		}

		let mut fields = Map::new();
		for name in &self.schema_fields {
			if self.prose_fields.contains(name) {
				// Absent root means the fragment was never created
				if let Some(fragment) = txn.get_xml_fragment(format!("prose:{}", name).as_str()) {
					let text = fragment.get_string(&txn);
					if !text.is_empty() {
						fields.insert(name.to_string(), Value::String(text));
					}
				}
			} else if let Some(value) = read_json(&entry.fields, &txn, name) {
				fields.insert(name.to_string(), value);
			}
		}
		Ok(Some(DocView { id: entry.document.clone(), fields }))
	}

	pub fn encode_state(&self, document: &str) -> DsResult<Vec<u8>> {
		let entry = self.entry(document)?.ok_or(Error::NotFound)?;
		let txn = entry.doc.transact();
		Ok(txn.encode_state_as_update_v1(&StateVector::default()))
	}

	pub fn encode_state_vector(&self, document: &str) -> DsResult<Vec<u8>> {
		let entry = self.entry(document)?.ok_or(Error::NotFound)?;
		let txn = entry.doc.transact();
		Ok(txn.state_vector().encode_v1())
	}

	/// Local state the peer at `vector` has not seen.
	pub fn diff_against(&self, document: &str, vector: &[u8]) -> DsResult<Vec<u8>> {
		let entry = self.entry(document)?.ok_or(Error::NotFound)?;
		let sv = StateVector::decode_v1(vector)
			.map_err(|e| Error::Reconciliation(format!("undecodable state vector: {}", e)))?;
		let txn = entry.doc.transact();
		Ok(txn.encode_state_as_update_v1(&sv))
	}

	/// Vend an editor binding for a declared prose field. `on_edit` fires on
	/// every fragment-tagged transaction, which is how the replicator's
	/// debounced prose upload gets armed.
	pub async fn bind_fragment(
		&self,
		document: &str,
		field: &str,
		on_edit: Box<dyn Fn(&str) + Send + Sync>,
	) -> DsResult<ProseBinding> {
		if !self.prose_fields.contains(field) {
			return Err(Error::Prose(format!("field {} is not declared as prose", field)));
		}
		let entry = self.get_or_create(document).await?;
		let name = format!("prose:{}", field);
		let fragment = entry.doc.get_or_insert_xml_fragment(name.as_str());
		let fragment_origin: yrs::Origin = Origin::Fragment.into();
		let id: Box<str> = document.into();
		let sub = entry
			.doc
			.observe_update_v1(move |txn, _event| {
				if txn.origin() == Some(&fragment_origin) {
					on_edit(&id);
				}
			})
			.map_err(|e| Error::Internal(format!("update observer: {}", e)))?;
		Ok(ProseBinding {
			document: document.into(),
			doc: entry.doc.clone(),
			fragment,
			_pending_sub: sub,
		})
	}

	/// Destroy the document and tear down its provider.
	pub async fn delete(&self, document: &str) -> DsResult<()> {
		let entry = self.docs_write()?.remove(document);
		if let Some(entry) = entry {
			if let Some(provider) = entry.provider.lock().await.take() {
				provider.close().await?;
			}
			debug!("destroyed doc {}:{}", self.collection, document);
		}
		Ok(())
	}

	/// Drain every provider's pending writes.
	pub async fn flush(&self) -> DsResult<()> {
		let entries: Vec<Arc<DocEntry>> = self.docs_read()?.values().cloned().collect();
		for entry in entries {
			if let Some(provider) = entry.provider.lock().await.as_ref() {
				provider.flush().await?;
			}
		}
		Ok(())
	}

	/// Tear down all documents and providers.
	pub async fn close(&self) -> DsResult<()> {
		let entries: Vec<Box<str>> = self.documents()?;
		for document in entries {
			self.delete(&document).await?;
		}
		Ok(())
	}
}

impl std::fmt::Debug for ClientDocManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClientDocManager").field("collection", &self.collection).finish()
	}
}


// vim: ts=4
