//! SQLite-backed client cache adapter
//!
//! Durable local store for one device: per-scope snapshot and delta blobs
//! plus a JSON key-value table, with a [`MigrationDatabase`] view for the
//! schema migration engine.
//!
//! # Storage Layout
//!
//! - `snapshots(collection, data, state_vector, seq)` - one blob per scope
//! - `deltas(id AUTOINCREMENT, collection, data)` - ordered append log
//! - `kv(key, value)` - JSON-encoded values
//!
//! The `collection` column carries the full document scope string
//! ("{collection}:{document}"). Delta replay order is the autoincrement
//! insert order, which keeps hydration deterministic.

use async_trait::async_trait;
use sqlx::{
	sqlite::{self, SqlitePool, SqliteRow},
	Column, Row, TypeInfo, ValueRef,
};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use driftsync::cache_adapter::{CacheAdapter, CachedSnapshot, DocLoad, MigrationDatabase};
use driftsync::error::DsResult;

mod error;

pub use error::Error;

#[derive(Debug)]
pub struct CacheAdapterSqlite {
	db: SqlitePool,
}

impl CacheAdapterSqlite {
	/// Open (or create) `cache.db` under the given directory.
	pub async fn new(path: impl AsRef<Path>) -> DsResult<Self> {
		let db_path = path.as_ref().join("cache.db");
		let opts = sqlite::SqliteConnectOptions::new()
			.filename(&db_path)
			.create_if_missing(true)
			.journal_mode(sqlite::SqliteJournalMode::Wal);

		let db = sqlite::SqlitePoolOptions::new()
			.max_connections(1)
			.connect_with(opts)
			.await
			.map_err(Error::from)?;

		init_db(&db).await.map_err(Error::from)?;
		debug!("cache adapter ready at {:?}", db_path);
		Ok(Self { db })
	}
}

async fn init_db(db: &SqlitePool) -> Result<(), sqlx::Error> {
	let mut tx = db.begin().await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS snapshots (
		collection TEXT PRIMARY KEY,
		data BLOB NOT NULL,
		state_vector BLOB NOT NULL,
		seq INTEGER NOT NULL
	)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS deltas (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		collection TEXT NOT NULL,
		data BLOB NOT NULL
	)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query("CREATE INDEX IF NOT EXISTS idx_deltas_collection ON deltas(collection)")
		.execute(&mut *tx)
		.await?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS kv (
		key TEXT PRIMARY KEY,
		value TEXT
	)",
	)
	.execute(&mut *tx)
	.await?;

	tx.commit().await?;
	Ok(())
}

#[async_trait]
impl CacheAdapter for CacheAdapterSqlite {
	async fn load_document(&self, scope: &str) -> DsResult<DocLoad> {
		let snapshot = sqlx::query(
			"SELECT data, state_vector, seq FROM snapshots WHERE collection = ?1",
		)
		.bind(scope)
		.fetch_optional(&self.db)
		.await
		.map_err(Error::from)?;
		let snapshot = match snapshot {
			Some(row) => Some(CachedSnapshot {
				bytes: row.try_get::<Vec<u8>, _>("data").map_err(Error::from)?,
				vector: row.try_get::<Vec<u8>, _>("state_vector").map_err(Error::from)?,
				seq: row.try_get::<i64, _>("seq").map_err(Error::from)? as u64,
			}),
			None => None,
		};

		let rows = sqlx::query("SELECT data FROM deltas WHERE collection = ?1 ORDER BY id ASC")
			.bind(scope)
			.fetch_all(&self.db)
			.await
			.map_err(Error::from)?;
		let deltas = rows
			.iter()
			.map(|row| row.try_get::<Vec<u8>, _>("data"))
			.collect::<Result<Vec<_>, _>>()
			.map_err(Error::from)?;

		Ok(DocLoad { snapshot, deltas })
	}

	async fn append_delta(&self, scope: &str, bytes: &[u8]) -> DsResult<()> {
		sqlx::query("INSERT INTO deltas (collection, data) VALUES (?1, ?2)")
			.bind(scope)
			.bind(bytes)
			.execute(&self.db)
			.await
			.map_err(Error::from)?;
		Ok(())
	}

	async fn put_snapshot(&self, scope: &str, snapshot: &CachedSnapshot) -> DsResult<()> {
		let mut tx = self.db.begin().await.map_err(Error::from)?;
		sqlx::query(
			"INSERT OR REPLACE INTO snapshots (collection, data, state_vector, seq)
			VALUES (?1, ?2, ?3, ?4)",
		)
		.bind(scope)
		.bind(snapshot.bytes.as_slice())
		.bind(snapshot.vector.as_slice())
		.bind(snapshot.seq as i64)
		.execute(&mut *tx)
		.await
		.map_err(Error::from)?;
		// The snapshot accounts for every delta written before it
		sqlx::query("DELETE FROM deltas WHERE collection = ?1")
			.bind(scope)
			.execute(&mut *tx)
			.await
			.map_err(Error::from)?;
		tx.commit().await.map_err(Error::from)?;
		Ok(())
	}

	async fn remove_document(&self, scope: &str) -> DsResult<()> {
		let mut tx = self.db.begin().await.map_err(Error::from)?;
		sqlx::query("DELETE FROM snapshots WHERE collection = ?1")
			.bind(scope)
			.execute(&mut *tx)
			.await
			.map_err(Error::from)?;
		sqlx::query("DELETE FROM deltas WHERE collection = ?1")
			.bind(scope)
			.execute(&mut *tx)
			.await
			.map_err(Error::from)?;
		tx.commit().await.map_err(Error::from)?;
		Ok(())
	}

	async fn list_documents(&self, prefix: &str) -> DsResult<Vec<Box<str>>> {
		let rows = sqlx::query(
			"SELECT collection FROM snapshots WHERE substr(collection, 1, length(?1)) = ?1
			UNION
			SELECT collection FROM deltas WHERE substr(collection, 1, length(?1)) = ?1
			ORDER BY collection",
		)
		.bind(prefix)
		.fetch_all(&self.db)
		.await
		.map_err(Error::from)?;
		let mut ids = Vec::with_capacity(rows.len());
		for row in &rows {
			let scope: String = row.try_get("collection").map_err(Error::from)?;
			if let Some(id) = scope.strip_prefix(prefix) {
				ids.push(id.into());
			}
		}
		Ok(ids)
	}

	async fn clear_documents(&self, prefix: &str) -> DsResult<()> {
		let mut tx = self.db.begin().await.map_err(Error::from)?;
		sqlx::query("DELETE FROM snapshots WHERE substr(collection, 1, length(?1)) = ?1")
			.bind(prefix)
			.execute(&mut *tx)
			.await
			.map_err(Error::from)?;
		sqlx::query("DELETE FROM deltas WHERE substr(collection, 1, length(?1)) = ?1")
			.bind(prefix)
			.execute(&mut *tx)
			.await
			.map_err(Error::from)?;
		tx.commit().await.map_err(Error::from)?;
		Ok(())
	}

	async fn kv_get(&self, key: &str) -> DsResult<Option<serde_json::Value>> {
		let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
			.bind(key)
			.fetch_optional(&self.db)
			.await
			.map_err(Error::from)?;
		match row {
			Some(row) => {
				let text: Option<String> = row.try_get("value").map_err(Error::from)?;
				match text {
					Some(text) => Ok(Some(serde_json::from_str(&text).map_err(Error::from)?)),
					None => Ok(None),
				}
			}
			None => Ok(None),
		}
	}

	async fn kv_set(&self, key: &str, value: &serde_json::Value) -> DsResult<()> {
		let text = serde_json::to_string(value).map_err(Error::from)?;
		sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")
			.bind(key)
			.bind(text)
			.execute(&self.db)
			.await
			.map_err(Error::from)?;
		Ok(())
	}

	async fn kv_del(&self, key: &str) -> DsResult<()> {
		sqlx::query("DELETE FROM kv WHERE key = ?1")
			.bind(key)
			.execute(&self.db)
			.await
			.map_err(Error::from)?;
		Ok(())
	}

	async fn close(&self) -> DsResult<()> {
		self.db.close().await;
		Ok(())
	}

	fn migration_db(&self) -> Option<Arc<dyn MigrationDatabase>> {
		Some(Arc::new(MigrationDbSqlite { db: self.db.clone() }))
	}
}

/// SQL surface handed to the migration engine; shares the adapter's pool.
pub struct MigrationDbSqlite {
	db: SqlitePool,
}

fn bind_params<'q>(
	mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
	params: &'q [serde_json::Value],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
	for param in params {
		query = match param {
			serde_json::Value::Null => query.bind(Option::<String>::None),
			serde_json::Value::Bool(b) => query.bind(i64::from(*b)),
			serde_json::Value::Number(n) => {
				if let Some(i) = n.as_i64() {
					query.bind(i)
				} else {
					query.bind(n.as_f64().unwrap_or_default())
				}
			}
			serde_json::Value::String(s) => query.bind(s.as_str()),
			other => query.bind(other.to_string()),
		};
	}
	query
}

fn row_to_json(row: &SqliteRow) -> Result<serde_json::Value, sqlx::Error> {
	let mut object = serde_json::Map::new();
	for (idx, column) in row.columns().iter().enumerate() {
		let value = match row.try_get_raw(idx) {
			Ok(raw) if raw.is_null() => serde_json::Value::Null,
			Ok(raw) => match raw.type_info().name() {
				"INTEGER" => serde_json::Value::from(row.try_get::<i64, _>(idx)?),
				"REAL" => serde_json::Value::from(row.try_get::<f64, _>(idx)?),
				"BLOB" => serde_json::Value::from(row.try_get::<Vec<u8>, _>(idx)?),
				_ => serde_json::Value::from(row.try_get::<String, _>(idx)?),
			},
			Err(e) => return Err(e),
		};
		object.insert(column.name().to_owned(), value);
	}
	Ok(serde_json::Value::Object(object))
}

#[async_trait]
impl MigrationDatabase for MigrationDbSqlite {
	async fn run(&self, sql: &str, params: &[serde_json::Value]) -> DsResult<u64> {
		let result = bind_params(sqlx::query(sql), params)
			.execute(&self.db)
			.await
			.map_err(Error::from)?;
		Ok(result.rows_affected())
	}

	async fn exec(&self, sql: &str) -> DsResult<()> {
		sqlx::query(sql).execute(&self.db).await.map_err(Error::from)?;
		Ok(())
	}

	async fn get(&self, sql: &str, params: &[serde_json::Value]) -> DsResult<Option<serde_json::Value>> {
		let row = bind_params(sqlx::query(sql), params)
			.fetch_optional(&self.db)
			.await
			.map_err(Error::from)?;
		match row {
			Some(row) => Ok(Some(row_to_json(&row).map_err(Error::from)?)),
			None => Ok(None),
		}
	}

	async fn all(&self, sql: &str, params: &[serde_json::Value]) -> DsResult<Vec<serde_json::Value>> {
		let rows = bind_params(sqlx::query(sql), params)
			.fetch_all(&self.db)
			.await
			.map_err(Error::from)?;
		rows.iter().map(|row| row_to_json(row).map_err(|e| Error::from(e).into())).collect()
	}
}

impl std::fmt::Debug for MigrationDbSqlite {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MigrationDbSqlite").finish()
	}
}

// vim: ts=4
