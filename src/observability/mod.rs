pub mod logging;
pub mod metrics;

pub use logging::{init_logging, sanitize_url_for_logging};
pub use metrics::ForumMetrics;
