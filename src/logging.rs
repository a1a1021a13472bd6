use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Ensure initialization happens only once
static INIT: Once = Once::new();

/// Initialize the logging system with sensible defaults.
///
/// Log level can be set using the RUST_LOG environment variable.
/// Example: RUST_LOG=debug,gatekeeper=trace
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true) // concurrent requests interleave
                    .with_line_number(true),
            )
            .init();

        tracing::info!("Logging initialized");
    });
}

/// Same as [`init`] but emits one JSON object per line, for log shippers.
pub fn init_json() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .init();

        tracing::info!("Logging initialized");
    });
}

/// Picks the output format from `GATEKEEPER_LOG_JSON`: JSON lines when it is
/// set to a true value, human-readable text otherwise.
pub fn init_from_env() {
    if json_requested(std::env::var("GATEKEEPER_LOG_JSON").ok().as_deref()) {
        init_json();
    } else {
        init();
    }
}

fn json_requested(value: Option<&str>) -> bool {
    value.is_some_and(|raw| {
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Macro for logging one admission decision
#[macro_export]
macro_rules! rate_limit_event {
    ($key:expr, $pattern:expr, $allowed:expr, $remaining:expr, $limit:expr) => {
        tracing::debug!(
            key = $key,
            rule = $pattern,
            allowed = $allowed,
            remaining = $remaining,
            limit = $limit,
            "Rate limit check"
        )
    };
}

/// Macro for logging storage operations with timing
#[macro_export]
macro_rules! storage_op {
    ($operation:expr, $key:expr, $success:expr, $elapsed_ms:expr) => {
        tracing::trace!(
            operation = $operation,
            key = $key,
            success = $success,
            elapsed_ms = $elapsed_ms,
            "Storage operation"
        )
    };
}

#[cfg(test)]
mod tests {
    use super::json_requested;

    #[test]
    fn json_format_needs_an_explicit_true() {
        assert!(json_requested(Some("1")));
        assert!(json_requested(Some(" TRUE ")));
        assert!(!json_requested(Some("0")));
        assert!(!json_requested(Some("")));
        assert!(!json_requested(None));
    }
}
