use tracing_subscriber::{fmt, EnvFilter};
use crate::error::{ForumError, ForumResult};

/// Install the global JSON subscriber.
///
/// Honors `RUST_LOG`; defaults to `info`. Calling it twice is an error from
/// `tracing-subscriber`, surfaced here as a config error.
pub fn init_logging() -> ForumResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .json()
        .try_init()
        .map_err(|e| ForumError::ConfigError(format!("Failed to initialize logging: {}", e)))
}

/// Sanitize URL for logging by masking credentials
pub fn sanitize_url_for_logging(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        let mut sanitized = parsed.clone();
        if parsed.password().is_some() {
            let _ = sanitized.set_password(Some("***"));
        }
        if !parsed.username().is_empty() {
            let _ = sanitized.set_username("***");
        }
        sanitized.to_string()
    } else {
        // If URL parsing fails, just mask the entire thing after the protocol
        if let Some(pos) = url.find("://") {
            format!("{}://***", &url[..pos])
        } else {
            "***".to_string()
        }
    }
}
