//! Schema migration engine.
//!
//! Keeps the SQL-backed local cache aligned with the collection's
//! [`VersionedSchema`]. Detects the stored version, diffs it against the
//! target shape, generates `ALTER` statements (column names validated), and
//! stamps the new version only after every statement succeeded. Failures are
//! routed through the caller's error handler, whose decision is respected
//! verbatim; unsynced writes are never silently discarded.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::prelude::*;
use crate::schema::{SchemaChange, VersionedSchema};
use driftsync_types::cache_adapter::{kv_keys, CacheAdapter, MigrationDatabase};
use driftsync_types::error::{MigrationCode, MigrationContext, MigrationDecision};

/// Bound on handler-driven retries before giving up.
const RETRY_BUDGET: u32 = 3;

/// Caller-provided migration routine for one target version; replaces the
/// generated SQL when present.
pub type MigrationFn = Arc<
	dyn for<'a> Fn(&'a dyn MigrationDatabase) -> futures::future::BoxFuture<'a, DsResult<()>>
		+ Send
		+ Sync,
>;

/// Error handler consulted on every migration failure.
pub type MigrationHandler =
	Arc<dyn Fn(&Error, &MigrationContext) -> MigrationDecision + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
	pub migrated: bool,
	pub from_version: u32,
	pub to_version: u32,
}

pub struct MigrationEngine {
	schema: VersionedSchema,
	db: Arc<dyn MigrationDatabase>,
	/// Needed for the reset decision and for pending-write accounting
	adapter: Option<Arc<dyn CacheAdapter>>,
	custom: HashMap<u32, MigrationFn>,
	handler: Option<MigrationHandler>,
}

impl MigrationEngine {
	pub fn new(schema: VersionedSchema, db: Arc<dyn MigrationDatabase>) -> Self {
		Self { schema, db, adapter: None, custom: HashMap::new(), handler: None }
	}

	pub fn with_adapter(mut self, adapter: Arc<dyn CacheAdapter>) -> Self {
		self.adapter = Some(adapter);
		self
	}

	pub fn with_migration(mut self, version: u32, f: MigrationFn) -> Self {
		self.custom.insert(version, f);
		self
	}

	pub fn with_handler(mut self, handler: MigrationHandler) -> Self {
		self.handler = Some(handler);
		self
	}

	/// Align the stored schema version with the target, running whatever
	/// migration work that requires.
	pub async fn run_migrations(&self) -> DsResult<MigrationReport> {
		self.ensure_version_table().await?;
		let target = self.schema.version;

		let stored = match self.stored_version().await? {
			Some(stored) => stored,
			None => {
				// First run: stamp and done
				self.stamp(target).await?;
				return Ok(MigrationReport { migrated: false, from_version: target, to_version: target });
			}
		};
		if stored == target {
			return Ok(MigrationReport { migrated: false, from_version: stored, to_version: stored });
		}
		info!("migrating {} schema v{} -> v{}", self.schema.collection, stored, target);

		let mut attempts = 0;
		loop {
			match self.apply(stored).await {
				Ok(()) => {
					self.stamp(target).await?;
					return Ok(MigrationReport {
						migrated: true,
						from_version: stored,
						to_version: target,
					});
				}
				Err(e) => {
					let context = self.context().await?;
					let decision = match &self.handler {
						Some(handler) => handler(&e, &context),
						None => MigrationDecision::KeepOldSchema,
					};
					debug!("migration failure handled as {:?}: {}", decision, e);
					match decision {
						MigrationDecision::KeepOldSchema => return Err(e),
						MigrationDecision::Retry => {
							attempts += 1;
							if attempts >= RETRY_BUDGET {
								return Err(e);
							}
						}
						MigrationDecision::Reset => {
							self.reset_cache().await?;
							self.stamp(target).await?;
							return Ok(MigrationReport {
								migrated: true,
								from_version: stored,
								to_version: target,
							});
						}
						MigrationDecision::Custom(recover) => {
							recover()?;
							self.stamp(target).await?;
							return Ok(MigrationReport {
								migrated: true,
								from_version: stored,
								to_version: target,
							});
						}
					}
				}
			}
		}
	}

	async fn apply(&self, stored: u32) -> DsResult<()> {
		let target = self.schema.version;
		if let Some(custom) = self.custom.get(&target) {
			return custom(self.db.as_ref()).await;
		}

		let from = self.schema.shape(stored).ok_or_else(|| {
			Error::Migration(
				MigrationCode::SchemaMismatch,
				format!("no recorded shape for version {}", stored),
			)
		})?;
		let changes = VersionedSchema::diff(from, &self.schema.fields);
		let statements = generate_sql(&self.schema.collection, &changes)?;
		for sql in &statements {
			self.db
				.exec(sql)
				.await
				.map_err(|e| Error::Migration(MigrationCode::SqliteError, e.to_string()))?;
		}
		Ok(())
	}

	async fn ensure_version_table(&self) -> DsResult<()> {
		self.db
			.exec(
				"CREATE TABLE IF NOT EXISTS __replicate_schema (
				collection TEXT PRIMARY KEY,
				version INTEGER NOT NULL,
				migratedAt INTEGER NOT NULL
			)",
			)
			.await
			.map_err(|e| Error::Migration(MigrationCode::SqliteError, e.to_string()))
	}

	async fn stored_version(&self) -> DsResult<Option<u32>> {
		let row = self
			.db
			.get(
				"SELECT version FROM __replicate_schema WHERE collection = ?1",
				&[json!(self.schema.collection.as_ref())],
			)
			.await?;
		Ok(row.and_then(|row| row.get("version").and_then(Value::as_u64)).map(|v| v as u32))
	}

	async fn stamp(&self, version: u32) -> DsResult<()> {
		self.db
			.run(
				"INSERT OR REPLACE INTO __replicate_schema (collection, version, migratedAt)
				VALUES (?1, ?2, ?3)",
				&[
					json!(self.schema.collection.as_ref()),
					json!(version),
					json!(Timestamp::now().0),
				],
			)
			.await?;
		Ok(())
	}

	async fn context(&self) -> DsResult<MigrationContext> {
		let (pending, last_synced) = match &self.adapter {
			Some(adapter) => {
				let queue = adapter.kv_get(&kv_keys::queue(&self.schema.collection)).await?;
				let pending = queue.and_then(|v| v.as_array().map(Vec::len)).unwrap_or(0);
				let last = adapter
					.kv_get(&format!("lastSync:{}", self.schema.collection))
					.await?
					.and_then(|v| v.as_i64())
					.map(Timestamp);
				(pending, last)
			}
			None => (0, None),
		};
		Ok(MigrationContext {
			can_reset_safely: pending == 0,
			pending_changes: pending,
			last_synced_at: last_synced,
		})
	}

	/// Wipe the collection's cached snapshots, deltas and cursor so sync
	/// restarts cleanly at the new schema.
	async fn reset_cache(&self) -> DsResult<()> {
		let Some(adapter) = &self.adapter else {
			return Ok(());
		};
		let prefix = format!("{}:", self.schema.collection);
		adapter.clear_documents(&prefix).await?;
		adapter.kv_del(&kv_keys::cursor(&self.schema.collection)).await?;
		adapter.kv_del(&kv_keys::queue(&self.schema.collection)).await?;
		warn!("reset local cache for {} after migration failure", self.schema.collection);
		Ok(())
	}
}

fn is_valid_ident(name: &str) -> bool {
	let mut chars = name.chars();
	match chars.next() {
		Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
		_ => return false,
	}
	chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn sql_literal(value: &Value) -> String {
	match value {
		Value::Null => "NULL".to_owned(),
		Value::Bool(b) => if *b { "1" } else { "0" }.to_owned(),
		Value::Number(n) => n.to_string(),
		Value::String(s) => format!("'{}'", s.replace('\'', "''")),
		other => format!("'{}'", other.to_string().replace('\'', "''")),
	}
}

/// Generate the ALTER statements for a shape diff. SQLite cannot retype a
/// column in place, so a type change is rewritten as rename + add + cast
/// copy + drop.
pub fn generate_sql(table: &str, changes: &[SchemaChange]) -> DsResult<Vec<String>> {
	if !is_valid_ident(table) {
		return Err(Error::ValidationError(format!("invalid table name: {}", table)));
	}
	let mut statements = Vec::new();
	for change in changes {
		match change {
			SchemaChange::AddColumn { column, kind, default_value } => {
				check_ident(column)?;
				let mut sql =
					format!("ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}", table, column, kind.sql_type());
				if let Some(default) = default_value {
					sql.push_str(&format!(" DEFAULT {}", sql_literal(default)));
				}
				statements.push(sql);
			}
			SchemaChange::RemoveColumn { column } => {
				check_ident(column)?;
				statements.push(format!("ALTER TABLE \"{}\" DROP COLUMN \"{}\"", table, column));
			}
			SchemaChange::ChangeType { column, to, .. } => {
				check_ident(column)?;
				let old = format!("{}__old", column);
				statements.push(format!(
					"ALTER TABLE \"{}\" RENAME COLUMN \"{}\" TO \"{}\"",
					table, column, old
				));
				statements.push(format!(
					"ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
					table,
					column,
					to.sql_type()
				));
				statements.push(format!(
					"UPDATE \"{}\" SET \"{}\" = CAST(\"{}\" AS {})",
					table,
					column,
					old,
					to.sql_type()
				));
				statements.push(format!("ALTER TABLE \"{}\" DROP COLUMN \"{}\"", table, old));
			}
		}
	}
	Ok(statements)
}

fn check_ident(column: &str) -> DsResult<()> {
	if is_valid_ident(column) {
		Ok(())
	} else {
		Err(Error::ValidationError(format!("invalid column name: {}", column)))
	}
}

impl std::fmt::Debug for MigrationEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MigrationEngine")
			.field("collection", &self.schema.collection)
			.field("version", &self.schema.version)
			.finish()
	}
}


// vim: ts=4
