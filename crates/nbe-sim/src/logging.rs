//! Subscriber setup for the `nbe` binary

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, for terminals
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Install the global subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Calling this
/// twice is harmless; the second call is ignored.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_ignored() {
        init_logging(LogFormat::Json);
        init_logging(LogFormat::Pretty);
    }
}
