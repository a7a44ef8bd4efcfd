//! Materialized view.
//!
//! The application-visible list of non-deleted documents for a collection.
//! The replicator keeps it consistent with the in-memory CRDT documents and
//! publishes change events on an MPMC channel the application drains.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::prelude::*;

/// Application-level projection of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocView {
	pub id: Box<str>,
	pub fields: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub enum ViewEvent {
	/// Full reload, e.g. after initial hydration or disparity re-base
	Replace(Vec<DocView>),
	Upsert(DocView),
	Remove(Box<str>),
}

pub struct MaterializedView {
	items: RwLock<BTreeMap<Box<str>, DocView>>,
	tx: flume::Sender<ViewEvent>,
	rx: flume::Receiver<ViewEvent>,
}

impl MaterializedView {
	pub fn new() -> Self {
		let (tx, rx) = flume::unbounded();
		Self { items: RwLock::new(BTreeMap::new()), tx, rx }
	}

	fn write(&self) -> DsResult<std::sync::RwLockWriteGuard<'_, BTreeMap<Box<str>, DocView>>> {
		self.items.write().map_err(|_| Error::Internal("view lock poisoned".into()))
	}

	pub fn replace(&self, items: Vec<DocView>) -> DsResult<()> {
		let mut guard = self.write()?;
		guard.clear();
		for item in &items {
			guard.insert(item.id.clone(), item.clone());
		}
		drop(guard);
		let _ = self.tx.send(ViewEvent::Replace(items));
		Ok(())
	}

	pub fn upsert(&self, item: DocView) -> DsResult<()> {
		self.write()?.insert(item.id.clone(), item.clone());
		let _ = self.tx.send(ViewEvent::Upsert(item));
		Ok(())
	}

	pub fn remove(&self, id: &str) -> DsResult<()> {
		let removed = self.write()?.remove(id).is_some();
		if removed {
			let _ = self.tx.send(ViewEvent::Remove(id.into()));
		}
		Ok(())
	}

	pub fn items(&self) -> DsResult<Vec<DocView>> {
		Ok(self
			.items
			.read()
			.map_err(|_| Error::Internal("view lock poisoned".into()))?
			.values()
			.cloned()
			.collect())
	}

	pub fn get(&self, id: &str) -> DsResult<Option<DocView>> {
		Ok(self
			.items
			.read()
			.map_err(|_| Error::Internal("view lock poisoned".into()))?
			.get(id)
			.cloned())
	}

	/// Change feed for the application; flume receivers are MPMC clones.
	pub fn events(&self) -> flume::Receiver<ViewEvent> {
		self.rx.clone()
	}
}

impl Default for MaterializedView {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for MaterializedView {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MaterializedView").finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn view(id: &str, title: &str) -> DocView {
		let mut fields = Map::new();
		fields.insert("title".into(), json!(title));
		DocView { id: id.into(), fields }
	}

	#[test]
	fn upsert_and_remove_emit_events() {
		let mv = MaterializedView::new();
		let events = mv.events();

		mv.upsert(view("a", "one")).unwrap();
		mv.upsert(view("a", "two")).unwrap();
		mv.remove("a").unwrap();
		mv.remove("a").unwrap(); // second remove is silent

		assert!(matches!(events.try_recv().unwrap(), ViewEvent::Upsert(_)));
		assert!(matches!(events.try_recv().unwrap(), ViewEvent::Upsert(_)));
		assert!(matches!(events.try_recv().unwrap(), ViewEvent::Remove(_)));
		assert!(events.try_recv().is_err());
		assert!(mv.items().unwrap().is_empty());
	}

	#[test]
	fn replace_resets_contents() {
		let mv = MaterializedView::new();
		mv.upsert(view("a", "one")).unwrap();
		mv.replace(vec![view("b", "two")]).unwrap();
		let items = mv.items().unwrap();
		assert_eq!(items.len(), 1);
		assert_eq!(items[0].id.as_ref(), "b");
	}
}

// vim: ts=4
