//! In-memory client cache adapter
//!
//! Keeps snapshots, deltas and the kv namespace in process memory. Used by
//! tests and by ephemeral clients that do not want durability. Writes are
//! synchronous, so `flush` is a no-op.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use driftsync::cache_adapter::{CacheAdapter, CachedSnapshot, DocLoad};
use driftsync::error::DsResult;

#[derive(Debug, Default, Clone)]
struct StoredDoc {
	snapshot: Option<CachedSnapshot>,
	deltas: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct CacheAdapterMemory {
	docs: DashMap<Box<str>, StoredDoc>,
	kv: DashMap<Box<str>, Value>,
}

impl CacheAdapterMemory {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl CacheAdapter for CacheAdapterMemory {
	async fn load_document(&self, scope: &str) -> DsResult<DocLoad> {
		Ok(self
			.docs
			.get(scope)
			.map(|doc| DocLoad { snapshot: doc.snapshot.clone(), deltas: doc.deltas.clone() })
			.unwrap_or_default())
	}

	async fn append_delta(&self, scope: &str, bytes: &[u8]) -> DsResult<()> {
		self.docs.entry(scope.into()).or_default().deltas.push(bytes.to_vec());
		Ok(())
	}

	async fn put_snapshot(&self, scope: &str, snapshot: &CachedSnapshot) -> DsResult<()> {
		let mut doc = self.docs.entry(scope.into()).or_default();
		doc.snapshot = Some(snapshot.clone());
		doc.deltas.clear();
		Ok(())
	}

	async fn remove_document(&self, scope: &str) -> DsResult<()> {
		self.docs.remove(scope);
		Ok(())
	}

	async fn list_documents(&self, prefix: &str) -> DsResult<Vec<Box<str>>> {
		let mut ids: Vec<Box<str>> = self
			.docs
			.iter()
			.filter_map(|entry| entry.key().strip_prefix(prefix).map(Into::into))
			.collect();
		ids.sort();
		Ok(ids)
	}

	async fn clear_documents(&self, prefix: &str) -> DsResult<()> {
		self.docs.retain(|key, _| !key.starts_with(prefix));
		Ok(())
	}

	async fn kv_get(&self, key: &str) -> DsResult<Option<Value>> {
		Ok(self.kv.get(key).map(|v| v.clone()))
	}

	async fn kv_set(&self, key: &str, value: &Value) -> DsResult<()> {
		self.kv.insert(key.into(), value.clone());
		Ok(())
	}

	async fn kv_del(&self, key: &str) -> DsResult<()> {
		self.kv.remove(key);
		Ok(())
	}

	async fn close(&self) -> DsResult<()> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn snapshot_absorbs_deltas() {
		let cache = CacheAdapterMemory::new();
		cache.append_delta("tasks:a", &[1, 2, 3]).await.unwrap();
		cache.append_delta("tasks:a", &[4, 5]).await.unwrap();

		let load = cache.load_document("tasks:a").await.unwrap();
		assert_eq!(load.deltas.len(), 2);

		cache
			.put_snapshot(
				"tasks:a",
				&CachedSnapshot { bytes: vec![9], vector: vec![0], seq: 2 },
			)
			.await
			.unwrap();
		let load = cache.load_document("tasks:a").await.unwrap();
		assert!(load.deltas.is_empty());
		assert_eq!(load.snapshot.unwrap().seq, 2);
	}

	#[tokio::test]
	async fn listing_strips_the_prefix() {
		let cache = CacheAdapterMemory::new();
		cache.append_delta("tasks:a", &[1]).await.unwrap();
		cache.append_delta("tasks:b", &[1]).await.unwrap();
		cache.append_delta("notes:z", &[1]).await.unwrap();

		let ids = cache.list_documents("tasks:").await.unwrap();
		assert_eq!(ids, vec![Box::from("a"), Box::from("b")]);

		cache.clear_documents("tasks:").await.unwrap();
		assert!(cache.list_documents("tasks:").await.unwrap().is_empty());
		assert_eq!(cache.list_documents("notes:").await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn kv_round_trip() {
		let cache = CacheAdapterMemory::new();
		cache.kv_set("clientId", &json!("abc")).await.unwrap();
		assert_eq!(cache.kv_get("clientId").await.unwrap(), Some(json!("abc")));
		cache.kv_del("clientId").await.unwrap();
		assert_eq!(cache.kv_get("clientId").await.unwrap(), None);
	}
}

// vim: ts=4
