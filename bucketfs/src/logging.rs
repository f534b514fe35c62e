//! Logging setup on top of `tracing-subscriber`.
//!
//! The configured severity becomes the default filter; `RUST_LOG` overrides it.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogSeverity};

pub fn env_filter(severity: LogSeverity) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(severity.directive()))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.severity))
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig {
            severity: LogSeverity::Debug,
        };
        // Whichever test installs first wins; a repeat must report an error.
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}
