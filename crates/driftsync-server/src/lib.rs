//! Server-side replication engine.
//!
//! Holds the append-only CRDT event log, the per-document compaction
//! machinery, and the presence registry, tied together by [`Engine`] which
//! implements the [`driftsync_types::api::SyncApi`] operation surface.
//!
//! Persistence is delegated to a [`driftsync_types::log_store::LogStore`]
//! adapter; the engine owns the semantics (sequence discipline, disparity
//! recovery, compaction safety) and the adapter owns the storage.

mod prelude;

pub mod compactor;
pub mod engine;
pub mod log;
pub mod sessions;

pub use compactor::Compactor;
pub use engine::Engine;
pub use log::ServerLog;
pub use sessions::SessionRegistry;

// vim: ts=4
