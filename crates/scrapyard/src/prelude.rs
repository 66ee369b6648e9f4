pub use scrapyard_types::error::{Error, SyResult};
pub use scrapyard_types::types::{NewSite, Patch, Site, SiteUpdate, Timestamp};

pub use tracing::{debug, debug_span, error, error_span, info, info_span, warn, warn_span};

// vim: ts=4
