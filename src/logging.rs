//! Logging initialization

use shardrelay_config::{LogFormat, LoggingSection};
use shardrelay_core::{Result, ShardRelayError};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber described by `[logging]`
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(logging: &LoggingSection) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}", logging.level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let installed = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };

    installed.map_err(|e| ShardRelayError::internal(format!("Failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let logging = LoggingSection::default();
        let _ = init(&logging);
        assert!(init(&logging).is_err());
    }
}
