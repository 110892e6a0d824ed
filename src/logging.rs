use anyhow::anyhow;
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingSettings};

/// Install the global subscriber. Logs go to stderr with elapsed-time
/// stamps; `RUST_LOG` overrides the configured level.
pub fn init_logging(settings: &LoggingSettings) -> anyhow::Result<()> {
    let filter = build_filter(&settings.level)?;
    let result = match settings.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_timer(uptime())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(uptime())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow!("install log subscriber: {e}"))?;
    tracing::debug!(level = %settings.level, format = ?settings.format, "logging initialized");
    Ok(())
}

fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| anyhow!("invalid log level {level:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_directive_strings() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(build_filter("info").is_ok());
        assert!(build_filter("warn,breton_translator=debug").is_ok());
    }
}
