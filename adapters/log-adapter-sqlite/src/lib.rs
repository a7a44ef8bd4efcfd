//! SQLite-backed server log adapter
//!
//! Implements the `LogStore` trait over sqlx/SQLite for persistent storage of
//! the append-only delta log, per-document snapshots, session rows, and
//! compaction job state.
//!
//! # Storage Layout
//!
//! - `deltas` - opaque CRDT update blobs keyed by (collection, seq)
//! - `snapshots` - one merged state blob per (collection, document)
//! - `sequences` - per-collection monotonic counter
//! - `delta_counts` - cached per-document delta counts
//! - `sessions` - peer presence and sync progress
//! - `compaction` - persisted compaction job state machine rows
//!
//! # Concurrency
//!
//! Writes go through a single-connection pool so counter allocation,
//! delta insert and count maintenance commit as one serialized transaction;
//! reads use a small read-only pool. WAL mode keeps readers off the writer's
//! back.

use async_trait::async_trait;
use sqlx::{
	sqlite::{self, SqlitePool, SqliteRow},
	Row,
};
use std::path::Path;
use tracing::debug;

use driftsync::error::DsResult;
use driftsync::log_store::{
	AppendResult, CompactionRow, DeltaRow, JobPhase, JobStatus, LogStore, SessionRow, SnapshotRow,
};
use driftsync::types::Timestamp;

mod error;
mod schema;

pub use error::Error;
use schema::init_db;

#[derive(Debug)]
pub struct LogAdapterSqlite {
	db: SqlitePool,
	dbr: SqlitePool,
}

impl LogAdapterSqlite {
	/// Open (or create) `log.db` under the given directory.
	pub async fn new(path: impl AsRef<Path>) -> DsResult<Self> {
		let db_path = path.as_ref().join("log.db");
		let opts = sqlite::SqliteConnectOptions::new()
			.filename(&db_path)
			.create_if_missing(true)
			.journal_mode(sqlite::SqliteJournalMode::Wal);

		let db = sqlite::SqlitePoolOptions::new()
			.max_connections(1)
			.connect_with(opts.clone())
			.await
			.map_err(Error::from)?;
		let dbr = sqlite::SqlitePoolOptions::new()
			.max_connections(4)
			.connect_with(opts.read_only(true))
			.await
			.map_err(Error::from)?;

		init_db(&db).await.map_err(Error::from)?;
		debug!("log adapter ready at {:?}", db_path);

		Ok(Self { db, dbr })
	}
}

fn delta_from_row(row: &SqliteRow) -> Result<DeltaRow, sqlx::Error> {
	Ok(DeltaRow {
		collection: row.try_get::<String, _>("collection")?.into(),
		document: row.try_get::<String, _>("document")?.into(),
		bytes: row.try_get::<Vec<u8>, _>("bytes")?,
		seq: row.try_get::<i64, _>("seq")? as u64,
		exists: row.try_get::<bool, _>("exists")?,
	})
}

fn snapshot_from_row(row: &SqliteRow) -> Result<SnapshotRow, sqlx::Error> {
	Ok(SnapshotRow {
		collection: row.try_get::<String, _>("collection")?.into(),
		document: row.try_get::<String, _>("document")?.into(),
		bytes: row.try_get::<Vec<u8>, _>("bytes")?,
		vector: row.try_get::<Vec<u8>, _>("vector")?,
		seq: row.try_get::<i64, _>("seq")? as u64,
		created: Timestamp(row.try_get::<i64, _>("created")?),
	})
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRow, sqlx::Error> {
	let profile: Option<String> = row.try_get("profile")?;
	let cursor: Option<String> = row.try_get("cursor")?;
	Ok(SessionRow {
		collection: row.try_get::<String, _>("collection")?.into(),
		document: row.try_get::<String, _>("document")?.into(),
		client: row.try_get::<String, _>("client")?.into(),
		connected: row.try_get::<bool, _>("connected")?,
		seq: row.try_get::<i64, _>("seq")? as u64,
		seen: Timestamp(row.try_get::<i64, _>("seen")?),
		vector: row.try_get::<Option<Vec<u8>>, _>("vector")?,
		user: row.try_get::<Option<String>, _>("user")?.map(Into::into),
		profile: profile.and_then(|s| serde_json::from_str(&s).ok()),
		cursor: cursor.and_then(|s| serde_json::from_str(&s).ok()),
		deadline: row.try_get::<Option<i64>, _>("deadline")?.map(Timestamp),
	})
}

fn job_from_row(row: &SqliteRow) -> DsResult<CompactionRow> {
	let status: String = row.try_get("status").map_err(Error::from)?;
	let phase: String = row.try_get("phase").map_err(Error::from)?;
	Ok(CompactionRow {
		collection: row.try_get::<String, _>("collection").map_err(Error::from)?.into(),
		document: row.try_get::<String, _>("document").map_err(Error::from)?.into(),
		status: JobStatus::parse(&status)?,
		phase: JobPhase::parse(&phase)?,
		cursor: row.try_get::<Option<i64>, _>("cursor").map_err(Error::from)?.map(|v| v as u64),
		boundary_seq: row
			.try_get::<Option<i64>, _>("boundary_seq")
			.map_err(Error::from)?
			.map(|v| v as u64),
		scratch: row.try_get::<Option<Vec<u8>>, _>("scratch").map_err(Error::from)?,
		processed: row.try_get::<i64, _>("processed").map_err(Error::from)? as u32,
		retries: row.try_get::<i64, _>("retries").map_err(Error::from)? as u32,
		timeout_secs: row.try_get::<i64, _>("timeout").map_err(Error::from)?,
		page_size: row.try_get::<i64, _>("page_size").map_err(Error::from)? as u32,
		max_pages: row.try_get::<i64, _>("max_pages").map_err(Error::from)? as u32,
		max_deltas: row.try_get::<i64, _>("max_deltas").map_err(Error::from)? as u32,
		retain: row.try_get::<i64, _>("retain").map_err(Error::from)? as u32,
		started: Timestamp(row.try_get::<i64, _>("started").map_err(Error::from)?),
		completed: row.try_get::<Option<i64>, _>("completed").map_err(Error::from)?.map(Timestamp),
		error: row.try_get::<Option<String>, _>("error").map_err(Error::from)?.map(Into::into),
	})
}

#[async_trait]
impl LogStore for LogAdapterSqlite {
	async fn append_delta(
		&self,
		collection: &str,
		document: &str,
		bytes: &[u8],
		exists: bool,
	) -> DsResult<AppendResult> {
		let mut tx = self.db.begin().await.map_err(Error::from)?;

		// Allocate the next seq; first use seeds from max(seq) of any
		// pre-existing deltas so monotonicity survives adoption
		let row = sqlx::query(
			"INSERT INTO sequences (collection, seq)
			VALUES (?1, COALESCE((SELECT MAX(seq) FROM deltas WHERE collection = ?1), 0) + 1)
			ON CONFLICT(collection) DO UPDATE SET seq = seq + 1
			RETURNING seq",
		)
		.bind(collection)
		.fetch_one(&mut *tx)
		.await
		.map_err(Error::from)?;
		let seq: i64 = row.try_get("seq").map_err(Error::from)?;

		sqlx::query(
			"INSERT INTO deltas (collection, document, bytes, seq, \"exists\")
			VALUES (?1, ?2, ?3, ?4, ?5)",
		)
		.bind(collection)
		.bind(document)
		.bind(bytes)
		.bind(seq)
		.bind(exists)
		.execute(&mut *tx)
		.await
		.map_err(Error::from)?;

		// First touch seeds the count from the table (insert above included)
		let row = sqlx::query(
			"INSERT INTO delta_counts (collection, document, count)
			VALUES (?1, ?2, (SELECT COUNT(*) FROM deltas WHERE collection = ?1 AND document = ?2))
			ON CONFLICT(collection, document) DO UPDATE SET count = count + 1
			RETURNING count",
		)
		.bind(collection)
		.bind(document)
		.fetch_one(&mut *tx)
		.await
		.map_err(Error::from)?;
		let count: i64 = row.try_get("count").map_err(Error::from)?;

		tx.commit().await.map_err(Error::from)?;
		Ok(AppendResult { seq: seq as u64, count: count as u64 })
	}

	async fn current_seq(&self, collection: &str) -> DsResult<u64> {
		let row = sqlx::query(
			"SELECT COALESCE(
				(SELECT seq FROM sequences WHERE collection = ?1),
				(SELECT MAX(seq) FROM deltas WHERE collection = ?1),
				0) AS seq",
		)
		.bind(collection)
		.fetch_one(&self.dbr)
		.await
		.map_err(Error::from)?;
		let seq: i64 = row.try_get("seq").map_err(Error::from)?;
		Ok(seq as u64)
	}

	async fn deltas_after(
		&self,
		collection: &str,
		cursor: u64,
		limit: u32,
	) -> DsResult<Vec<DeltaRow>> {
		let rows = sqlx::query(
			"SELECT collection, document, bytes, seq, \"exists\" FROM deltas
			WHERE collection = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
		)
		.bind(collection)
		.bind(cursor as i64)
		.bind(i64::from(limit))
		.fetch_all(&self.dbr)
		.await
		.map_err(Error::from)?;
		rows.iter().map(|row| delta_from_row(row).map_err(|e| Error::from(e).into())).collect()
	}

	async fn document_deltas(
		&self,
		collection: &str,
		document: &str,
		after: u64,
		up_to: Option<u64>,
		limit: u32,
	) -> DsResult<Vec<DeltaRow>> {
		let rows = match up_to {
			Some(up_to) => {
				sqlx::query(
					"SELECT collection, document, bytes, seq, \"exists\" FROM deltas
					WHERE collection = ?1 AND document = ?2 AND seq > ?3 AND seq <= ?4
					ORDER BY seq ASC LIMIT ?5",
				)
				.bind(collection)
				.bind(document)
				.bind(after as i64)
				.bind(up_to as i64)
				.bind(i64::from(limit))
				.fetch_all(&self.dbr)
				.await
			}
			None => {
				sqlx::query(
					"SELECT collection, document, bytes, seq, \"exists\" FROM deltas
					WHERE collection = ?1 AND document = ?2 AND seq > ?3
					ORDER BY seq ASC LIMIT ?4",
				)
				.bind(collection)
				.bind(document)
				.bind(after as i64)
				.bind(i64::from(limit))
				.fetch_all(&self.dbr)
				.await
			}
		}
		.map_err(Error::from)?;
		rows.iter().map(|row| delta_from_row(row).map_err(|e| Error::from(e).into())).collect()
	}

	async fn oldest_seq(&self, collection: &str) -> DsResult<Option<u64>> {
		let row = sqlx::query("SELECT MIN(seq) AS seq FROM deltas WHERE collection = ?1")
			.bind(collection)
			.fetch_one(&self.dbr)
			.await
			.map_err(Error::from)?;
		let seq: Option<i64> = row.try_get("seq").map_err(Error::from)?;
		Ok(seq.map(|v| v as u64))
	}

	async fn prune_deltas(
		&self,
		collection: &str,
		document: &str,
		up_to: u64,
		retain: u32,
	) -> DsResult<u64> {
		let mut tx = self.db.begin().await.map_err(Error::from)?;
		let res = sqlx::query(
			"DELETE FROM deltas
			WHERE collection = ?1 AND document = ?2 AND seq <= ?3
			AND seq NOT IN (
				SELECT seq FROM deltas
				WHERE collection = ?1 AND document = ?2 AND seq <= ?3
				ORDER BY seq DESC LIMIT ?4)",
		)
		.bind(collection)
		.bind(document)
		.bind(up_to as i64)
		.bind(i64::from(retain))
		.execute(&mut *tx)
		.await
		.map_err(Error::from)?;
		let deleted = res.rows_affected();

		sqlx::query(
			"UPDATE delta_counts SET count = MAX(count - ?3, 0)
			WHERE collection = ?1 AND document = ?2",
		)
		.bind(collection)
		.bind(document)
		.bind(deleted as i64)
		.execute(&mut *tx)
		.await
		.map_err(Error::from)?;

		tx.commit().await.map_err(Error::from)?;
		Ok(deleted)
	}

	async fn delta_count(&self, collection: &str, document: &str) -> DsResult<u64> {
		// Seed on first touch so adopted tables count correctly
		sqlx::query(
			"INSERT INTO delta_counts (collection, document, count)
			VALUES (?1, ?2, (SELECT COUNT(*) FROM deltas WHERE collection = ?1 AND document = ?2))
			ON CONFLICT(collection, document) DO NOTHING",
		)
		.bind(collection)
		.bind(document)
		.execute(&self.db)
		.await
		.map_err(Error::from)?;

		let row = sqlx::query(
			"SELECT count FROM delta_counts WHERE collection = ?1 AND document = ?2",
		)
		.bind(collection)
		.bind(document)
		.fetch_one(&self.dbr)
		.await
		.map_err(Error::from)?;
		let count: i64 = row.try_get("count").map_err(Error::from)?;
		Ok(count as u64)
	}

	async fn snapshot(&self, collection: &str, document: &str) -> DsResult<Option<SnapshotRow>> {
		let row = sqlx::query(
			"SELECT collection, document, bytes, vector, seq, created FROM snapshots
			WHERE collection = ?1 AND document = ?2",
		)
		.bind(collection)
		.bind(document)
		.fetch_optional(&self.dbr)
		.await
		.map_err(Error::from)?;
		match row {
			Some(row) => Ok(Some(snapshot_from_row(&row).map_err(Error::from)?)),
			None => Ok(None),
		}
	}

	async fn snapshots(&self, collection: &str) -> DsResult<Vec<SnapshotRow>> {
		let rows = sqlx::query(
			"SELECT collection, document, bytes, vector, seq, created FROM snapshots
			WHERE collection = ?1 ORDER BY document",
		)
		.bind(collection)
		.fetch_all(&self.dbr)
		.await
		.map_err(Error::from)?;
		rows.iter().map(|row| snapshot_from_row(row).map_err(|e| Error::from(e).into())).collect()
	}

	async fn upsert_snapshot(&self, row: &SnapshotRow) -> DsResult<()> {
		sqlx::query(
			"INSERT OR REPLACE INTO snapshots (collection, document, bytes, vector, seq, created)
			VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
		)
		.bind(row.collection.as_ref())
		.bind(row.document.as_ref())
		.bind(row.bytes.as_slice())
		.bind(row.vector.as_slice())
		.bind(row.seq as i64)
		.bind(row.created.0)
		.execute(&self.db)
		.await
		.map_err(Error::from)?;
		Ok(())
	}

	async fn upsert_session(&self, row: &SessionRow) -> DsResult<()> {
		let profile = match &row.profile {
			Some(value) => Some(serde_json::to_string(value).map_err(Error::from)?),
			None => None,
		};
		let cursor = match &row.cursor {
			Some(value) => Some(serde_json::to_string(value).map_err(Error::from)?),
			None => None,
		};
		sqlx::query(
			"INSERT OR REPLACE INTO sessions
			(collection, document, client, connected, seq, seen, vector, user, profile, cursor, deadline)
			VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
		)
		.bind(row.collection.as_ref())
		.bind(row.document.as_ref())
		.bind(row.client.as_ref())
		.bind(row.connected)
		.bind(row.seq as i64)
		.bind(row.seen.0)
		.bind(row.vector.as_deref())
		.bind(row.user.as_deref())
		.bind(profile)
		.bind(cursor)
		.bind(row.deadline.map(|t| t.0))
		.execute(&self.db)
		.await
		.map_err(Error::from)?;
		Ok(())
	}

	async fn session(
		&self,
		collection: &str,
		document: &str,
		client: &str,
	) -> DsResult<Option<SessionRow>> {
		let row = sqlx::query(
			"SELECT collection, document, client, connected, seq, seen, vector, user, profile, cursor, deadline
			FROM sessions WHERE collection = ?1 AND document = ?2 AND client = ?3",
		)
		.bind(collection)
		.bind(document)
		.bind(client)
		.fetch_optional(&self.dbr)
		.await
		.map_err(Error::from)?;
		match row {
			Some(row) => Ok(Some(session_from_row(&row).map_err(Error::from)?)),
			None => Ok(None),
		}
	}

	async fn sessions(&self, collection: &str, document: &str) -> DsResult<Vec<SessionRow>> {
		let rows = sqlx::query(
			"SELECT collection, document, client, connected, seq, seen, vector, user, profile, cursor, deadline
			FROM sessions WHERE collection = ?1 AND document = ?2",
		)
		.bind(collection)
		.bind(document)
		.fetch_all(&self.dbr)
		.await
		.map_err(Error::from)?;
		rows.iter().map(|row| session_from_row(row).map_err(|e| Error::from(e).into())).collect()
	}

	async fn mark_session(
		&self,
		collection: &str,
		document: &str,
		client: &str,
		seq: Option<u64>,
		vector: Option<Vec<u8>>,
		seen: Timestamp,
	) -> DsResult<()> {
		sqlx::query(
			"UPDATE sessions SET
				seen = ?4,
				seq = MAX(seq, COALESCE(?5, seq)),
				vector = COALESCE(?6, vector)
			WHERE collection = ?1 AND document = ?2 AND client = ?3",
		)
		.bind(collection)
		.bind(document)
		.bind(client)
		.bind(seen.0)
		.bind(seq.map(|v| v as i64))
		.bind(vector)
		.execute(&self.db)
		.await
		.map_err(Error::from)?;
		Ok(())
	}

	async fn set_disconnected(
		&self,
		collection: &str,
		document: &str,
		client: &str,
	) -> DsResult<()> {
		sqlx::query(
			"UPDATE sessions SET connected = 0, cursor = NULL, deadline = NULL
			WHERE collection = ?1 AND document = ?2 AND client = ?3",
		)
		.bind(collection)
		.bind(document)
		.bind(client)
		.execute(&self.db)
		.await
		.map_err(Error::from)?;
		Ok(())
	}

	async fn delete_stale_sessions(
		&self,
		collection: &str,
		document: &str,
		seen_before: Timestamp,
	) -> DsResult<u64> {
		let res = sqlx::query(
			"DELETE FROM sessions
			WHERE collection = ?1 AND document = ?2 AND connected = 0 AND seen < ?3",
		)
		.bind(collection)
		.bind(document)
		.bind(seen_before.0)
		.execute(&self.db)
		.await
		.map_err(Error::from)?;
		Ok(res.rows_affected())
	}

	async fn try_schedule_job(&self, row: &CompactionRow) -> DsResult<bool> {
		let mut tx = self.db.begin().await.map_err(Error::from)?;
		let existing = sqlx::query(
			"SELECT status FROM compaction WHERE collection = ?1 AND document = ?2",
		)
		.bind(row.collection.as_ref())
		.bind(row.document.as_ref())
		.fetch_optional(&mut *tx)
		.await
		.map_err(Error::from)?;
		if let Some(existing) = existing {
			let status: String = existing.try_get("status").map_err(Error::from)?;
			if status == JobStatus::Pending.as_str() || status == JobStatus::Running.as_str() {
				return Ok(false);
			}
		}
		upsert_job(&mut tx, row).await?;
		tx.commit().await.map_err(Error::from)?;
		Ok(true)
	}

	async fn job(&self, collection: &str, document: &str) -> DsResult<Option<CompactionRow>> {
		let row = sqlx::query(
			"SELECT collection, document, status, phase, cursor, boundary_seq, scratch, processed,
				retries, timeout, page_size, max_pages, max_deltas, retain, started, completed, error
			FROM compaction WHERE collection = ?1 AND document = ?2",
		)
		.bind(collection)
		.bind(document)
		.fetch_optional(&self.dbr)
		.await
		.map_err(Error::from)?;
		match row {
			Some(row) => Ok(Some(job_from_row(&row)?)),
			None => Ok(None),
		}
	}

	async fn update_job(&self, row: &CompactionRow) -> DsResult<()> {
		let mut tx = self.db.begin().await.map_err(Error::from)?;
		upsert_job(&mut tx, row).await?;
		tx.commit().await.map_err(Error::from)?;
		Ok(())
	}
}

async fn upsert_job(
	tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
	row: &CompactionRow,
) -> DsResult<()> {
	sqlx::query(
		"INSERT OR REPLACE INTO compaction
		(collection, document, status, phase, cursor, boundary_seq, scratch, processed,
			retries, timeout, page_size, max_pages, max_deltas, retain, started, completed, error)
		VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
	)
	.bind(row.collection.as_ref())
	.bind(row.document.as_ref())
	.bind(row.status.as_str())
	.bind(row.phase.as_str())
	.bind(row.cursor.map(|v| v as i64))
	.bind(row.boundary_seq.map(|v| v as i64))
	.bind(row.scratch.as_deref())
	.bind(i64::from(row.processed))
	.bind(i64::from(row.retries))
	.bind(row.timeout_secs)
	.bind(i64::from(row.page_size))
	.bind(i64::from(row.max_pages))
	.bind(i64::from(row.max_deltas))
	.bind(i64::from(row.retain))
	.bind(row.started.0)
	.bind(row.completed.map(|t| t.0))
	.bind(row.error.as_deref())
	.execute(&mut **tx)
	.await
	.map_err(Error::from)?;
	Ok(())
}

// vim: ts=4
