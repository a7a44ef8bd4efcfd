//! Core value types shared across the engine.

use serde::{Deserialize, Serialize};

/// Unix timestamp in seconds.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub fn now() -> Self {
		let secs = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();
		Self(secs as i64)
	}

	pub fn from_now(seconds: i64) -> Self {
		Self(Self::now().0 + seconds)
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Origin tag carried by CRDT transactions for echo suppression. The apply
/// paths use it to tell local edits, server-delivered changes, fragment
/// editor transactions, and storage hydration apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
	Local,
	Server,
	Fragment,
	Storage,
}

impl Origin {
	pub fn as_str(self) -> &'static str {
		match self {
			Origin::Local => "local",
			Origin::Server => "server",
			Origin::Fragment => "fragment",
			Origin::Storage => "storage",
		}
	}

	pub fn from_tag(tag: &[u8]) -> Option<Self> {
		match tag {
			b"local" => Some(Origin::Local),
			b"server" => Some(Origin::Server),
			b"fragment" => Some(Origin::Fragment),
			b"storage" => Some(Origin::Storage),
			_ => None,
		}
	}
}

impl From<Origin> for yrs::Origin {
	fn from(origin: Origin) -> Self {
		yrs::Origin::from(origin.as_str())
	}
}

/// Per-collection tuning knobs. Server-side writes may override `threshold`,
/// `session_timeout_secs` and `retain` per call through write hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
	/// Deltas accumulated on one document before a compaction job is scheduled
	pub threshold: u32,
	/// Peer inactivity before a session is eligible for GC
	pub session_timeout_secs: i64,
	/// Deltas kept (highest seq first) after a successful full compaction
	pub retain: u32,
	/// Presence heartbeat interval
	pub presence_interval_secs: u32,
	/// Debounce window for coalescing prose fragment edits before upload
	pub prose_debounce_ms: u64,
	/// Upload retry budget for transient failures
	pub max_retries: u32,
}

impl Default for CollectionConfig {
	fn default() -> Self {
		Self {
			threshold: 500,
			session_timeout_secs: 24 * 60 * 60,
			retain: 0,
			presence_interval_secs: 10,
			prose_debounce_ms: 50,
			max_retries: 3,
		}
	}
}


// vim: ts=4
