//! Error handling subsystem. Implements the shared Error type used across
//! the engine, the client stack, and the adapter crates.
//!
//! Adapter crates keep their own small internal error enums and convert into
//! this one at the trait boundary, so backend-specific detail never leaks
//! into the engine.

use crate::types::Timestamp;

pub type DsResult<T> = std::result::Result<T, Error>;

/// Error codes surfaced by the migration engine. Every migration failure is
/// routed through the user handler before it reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationCode {
	SchemaMismatch,
	SqliteError,
	CrdtError,
	NetworkError,
}

impl MigrationCode {
	pub fn as_str(self) -> &'static str {
		match self {
			MigrationCode::SchemaMismatch => "SCHEMA_MISMATCH",
			MigrationCode::SqliteError => "SQLITE_ERROR",
			MigrationCode::CrdtError => "YJS_ERROR",
			MigrationCode::NetworkError => "NETWORK_ERROR",
		}
	}
}

#[derive(Debug)]
pub enum Error {
	// Core errors
	NotFound,
	/// Write carried an empty payload
	EmptyDelta,
	/// Server pruned deltas past the caller's cursor and holds no snapshot.
	/// Fatal for the collection on the client; requires a local reset.
	MissingBaseline,
	/// Operation invoked before collection initialization completed
	CollectionNotReady,

	// Input validation and constraints
	ValidationError(String),
	Conflict(String),

	// Replication
	/// Invariant violation while applying server changes
	Reconciliation(String),
	/// Requested field is not declared as prose, or its fragment is missing
	Prose(String),
	/// Auth/validation-class failure from a collaborator (401/403/422)
	NonRetriable(u16, String),

	// Infrastructure
	Network(String),
	Storage(String),
	Migration(MigrationCode, String),
	Timeout,
	Internal(String),

	// externals
	Io(std::io::Error),
}

impl Error {
	/// Propagation policy: transient errors are handed to the caller's retry
	/// mechanism, the rest surface immediately.
	pub fn is_retriable(&self) -> bool {
		match self {
			Error::Network(_) | Error::Storage(_) | Error::Timeout | Error::Conflict(_) => true,
			Error::NotFound
			| Error::EmptyDelta
			| Error::MissingBaseline
			| Error::CollectionNotReady
			| Error::ValidationError(_)
			| Error::Reconciliation(_)
			| Error::Prose(_)
			| Error::NonRetriable(..)
			| Error::Migration(..)
			| Error::Internal(_)
			| Error::Io(_) => false,
		}
	}

	/// Map an HTTP-like status from a collaborating transport to the error
	/// policy: 401/403/422 are non-retriable, everything else is transient.
	pub fn from_status(status: u16, message: impl Into<String>) -> Self {
		match status {
			401 | 403 | 422 => Error::NonRetriable(status, message.into()),
			_ => Error::Network(message.into()),
		}
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::NotFound => write!(f, "not found"),
			Error::EmptyDelta => write!(f, "empty delta payload"),
			Error::MissingBaseline => write!(f, "deltas pruned and no snapshot exists"),
			Error::CollectionNotReady => write!(f, "collection not initialized"),
			Error::ValidationError(msg) => write!(f, "validation failed: {}", msg),
			Error::Conflict(msg) => write!(f, "conflict: {}", msg),
			Error::Reconciliation(msg) => write!(f, "reconciliation failed: {}", msg),
			Error::Prose(msg) => write!(f, "prose field error: {}", msg),
			Error::NonRetriable(status, msg) => write!(f, "non-retriable ({}): {}", status, msg),
			Error::Network(msg) => write!(f, "network error: {}", msg),
			Error::Storage(msg) => write!(f, "storage error: {}", msg),
			Error::Migration(code, msg) => write!(f, "migration error [{}]: {}", code.as_str(), msg),
			Error::Timeout => write!(f, "operation timeout"),
			Error::Internal(msg) => write!(f, "internal error: {}", msg),
			Error::Io(err) => write!(f, "io error: {}", err),
		}
	}
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Self::Io(err)
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Storage(format!("json: {}", err))
	}
}

/// Context handed to a migration error handler so it can decide how to
/// proceed without inspecting the local store itself.
#[derive(Debug, Clone)]
pub struct MigrationContext {
	/// True iff there are zero pending local deltas; a reset loses nothing
	pub can_reset_safely: bool,
	/// Number of locally queued writes that have not reached the server
	pub pending_changes: usize,
	pub last_synced_at: Option<Timestamp>,
}

/// Decision returned by a migration error handler. The engine respects the
/// decision verbatim and never silently discards unsynced writes.
pub enum MigrationDecision {
	/// Wipe the collection's cached snapshots/deltas/cursor and continue at
	/// the new schema version
	Reset,
	/// Abort the migration, keep the old schema, report the error
	KeepOldSchema,
	Retry,
	Custom(Box<dyn FnOnce() -> DsResult<()> + Send>),
}

impl std::fmt::Debug for MigrationDecision {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			MigrationDecision::Reset => write!(f, "Reset"),
			MigrationDecision::KeepOldSchema => write!(f, "KeepOldSchema"),
			MigrationDecision::Retry => write!(f, "Retry"),
			MigrationDecision::Custom(_) => write!(f, "Custom(..)"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retriable_classification() {
		assert!(Error::Network("down".into()).is_retriable());
		assert!(Error::Storage("locked".into()).is_retriable());
		assert!(!Error::MissingBaseline.is_retriable());
		assert!(!Error::NonRetriable(401, "no auth".into()).is_retriable());
		assert!(!Error::EmptyDelta.is_retriable());
	}

	#[test]
	fn status_mapping() {
		assert!(matches!(Error::from_status(403, "denied"), Error::NonRetriable(403, _)));
		assert!(matches!(Error::from_status(422, "bad doc"), Error::NonRetriable(422, _)));
		assert!(matches!(Error::from_status(500, "oops"), Error::Network(_)));
		assert!(matches!(Error::from_status(503, "busy"), Error::Network(_)));
	}
}

// vim: ts=4
