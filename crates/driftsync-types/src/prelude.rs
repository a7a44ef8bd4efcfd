pub use crate::error::{DsResult, Error};
pub use crate::types::{CollectionConfig, Origin, Timestamp};

pub use tracing::{debug, debug_span, error, error_span, info, info_span, trace, warn, warn_span};

// vim: ts=4
