//! Tracing subscriber setup.

use crate::config::{LogFormat, LogSettings};
use crate::error::{BridgeError, Result};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` wins, otherwise the configured level.
pub fn env_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings.level.to_string()))
}

/// Install the global tracing subscriber.
///
/// Returns an error if a subscriber is already installed; callers that may
/// run more than once should use [`try_init_tracing`].
pub fn init_tracing(settings: &LogSettings) -> Result<()> {
    let filter = env_filter(settings);
    let installed = match settings.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };
    installed.map_err(|e| BridgeError::failed_with("install tracing subscriber", e))
}

/// Like [`init_tracing`], but a second call is a no-op.
pub fn try_init_tracing(settings: &LogSettings) -> bool {
    init_tracing(settings).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_second_init_is_rejected() {
        let settings = LogSettings {
            level: LogLevel::Debug,
            format: LogFormat::Json,
        };
        let _ = try_init_tracing(&settings);
        assert!(init_tracing(&settings).is_err());
        assert!(!try_init_tracing(&settings));
    }
}
