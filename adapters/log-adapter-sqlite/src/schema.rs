//! Database schema initialization
//!
//! Creates the log tables and indexes. `exists` is an SQL keyword, so the
//! column is quoted throughout the adapter.

use sqlx::SqlitePool;

/// Initialize the database schema with all required tables and indexes
pub(crate) async fn init_db(db: &SqlitePool) -> Result<(), sqlx::Error> {
	let mut tx = db.begin().await?;

	// Append-only delta log
	//***********************
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS deltas (
		collection text NOT NULL,
		document text NOT NULL,
		bytes blob NOT NULL,
		seq integer NOT NULL,
		\"exists\" boolean NOT NULL DEFAULT 1,
		PRIMARY KEY(collection, seq)
	)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query(
		"CREATE INDEX IF NOT EXISTS idx_deltas_doc_seq ON deltas(collection, document, seq)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query("CREATE INDEX IF NOT EXISTS idx_deltas_doc ON deltas(collection, document)")
		.execute(&mut *tx)
		.await?;

	// Snapshots
	//***********
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS snapshots (
		collection text NOT NULL,
		document text NOT NULL,
		bytes blob NOT NULL,
		vector blob NOT NULL,
		seq integer NOT NULL,
		created datetime DEFAULT (unixepoch()),
		PRIMARY KEY(collection, document)
	)",
	)
	.execute(&mut *tx)
	.await?;

	// Sequence counters
	//*******************
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS sequences (
		collection text NOT NULL,
		seq integer NOT NULL,
		PRIMARY KEY(collection)
	)",
	)
	.execute(&mut *tx)
	.await?;

	// Cached per-document delta counts
	//**********************************
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS delta_counts (
		collection text NOT NULL,
		document text NOT NULL,
		count integer NOT NULL,
		PRIMARY KEY(collection, document)
	)",
	)
	.execute(&mut *tx)
	.await?;

	// Sessions
	//**********
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS sessions (
		collection text NOT NULL,
		document text NOT NULL,
		client text NOT NULL,
		connected boolean NOT NULL DEFAULT 0,
		seq integer NOT NULL DEFAULT 0,
		seen datetime NOT NULL,
		vector blob,
		user text,
		profile json,
		cursor json,
		deadline datetime,
		PRIMARY KEY(collection, document, client)
	)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_doc ON sessions(collection, document)")
		.execute(&mut *tx)
		.await?;

	// Compaction job state machine
	//******************************
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS compaction (
		collection text NOT NULL,
		document text NOT NULL,
		status text NOT NULL,
		phase text NOT NULL,
		cursor integer,
		boundary_seq integer,
		scratch blob,
		processed integer NOT NULL DEFAULT 0,
		retries integer NOT NULL DEFAULT 0,
		timeout integer NOT NULL,
		page_size integer NOT NULL,
		max_pages integer NOT NULL,
		max_deltas integer NOT NULL,
		retain integer NOT NULL,
		started datetime NOT NULL,
		completed datetime,
		error text,
		PRIMARY KEY(collection, document)
	)",
	)
	.execute(&mut *tx)
	.await?;

	tx.commit().await?;

	Ok(())
}

// vim: ts=4
