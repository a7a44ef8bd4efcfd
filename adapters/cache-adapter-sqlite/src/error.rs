//! Error types for the SQLite cache adapter

use std::fmt;

/// Adapter-internal errors
#[derive(Debug)]
pub enum Error {
	/// Database operation error
	DbError(String),

	/// Stored value did not decode to the expected shape
	DecodeError(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::DbError(msg) => write!(f, "Database error: {}", msg),
			Error::DecodeError(msg) => write!(f, "Decode error: {}", msg),
		}
	}
}

impl std::error::Error for Error {}

impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Error::DbError(err.to_string())
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::DecodeError(err.to_string())
	}
}

impl From<Error> for driftsync::error::Error {
	fn from(err: Error) -> Self {
		driftsync::error::Error::Storage(err.to_string())
	}
}

// vim: ts=4
