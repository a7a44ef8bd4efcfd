pub use driftsync_types::error::{DsResult, Error};
pub use driftsync_types::types::{CollectionConfig, Origin, Timestamp};

pub use tracing::{debug, debug_span, error, error_span, info, info_span, trace, warn, warn_span};

// vim: ts=4
