//! Client replication stack.
//!
//! Owns the in-memory CRDT documents of a collection, keeps them durable
//! through a pluggable cache adapter, reconciles them with the server stream,
//! queues local writes while offline, and keeps the SQL-backed cache schema
//! aligned with the collection's versioned schema.
//!
//! Dependency order (leaves first): persistence → docs → replicator →
//! presence; schema → migrate.

mod prelude;

pub mod docs;
pub mod migrate;
pub mod persistence;
pub mod presence;
pub mod replicator;
pub mod schema;
pub mod view;

pub use docs::{ClientDocManager, ProseBinding};
pub use migrate::{MigrationEngine, MigrationReport};
pub use persistence::DocPersistence;
pub use presence::PresenceCoordinator;
pub use replicator::Replicator;
pub use schema::{FieldDescriptor, FieldKind, SchemaChange, VersionedSchema};
pub use view::{DocView, MaterializedView, ViewEvent};

// vim: ts=4
