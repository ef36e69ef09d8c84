//! Subscriber setup and replay-aware logging macros.
//!
//! Orchestration code should log through the `durable_*` macros (or the
//! `trace_*` methods on the context): they stay silent while the context is
//! replaying, so a message is emitted once per decision and not once per pass.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Subscriber settings. Nothing is installed unless `install_subscriber` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is not set, e.g. `"info"` or `"durafunc=debug"`.
    pub level: String,
    pub install_subscriber: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            level: "info".to_string(),
            install_subscriber: false,
        }
    }
}

/// Install a global `tracing` subscriber according to `config`.
///
/// Returns an error when another subscriber is already installed; the
/// existing one keeps working, so callers usually only log that.
pub fn init_logging(config: &LoggingConfig) -> Result<(), String> {
    if !config.install_subscriber {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| format!("invalid log filter '{}': {e}", config.level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| format!("failed to install subscriber: {e}"))
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(instance_id = %$ctx.instance_id(), execution_id = $ctx.execution_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(instance_id = %$ctx.instance_id(), execution_id = $ctx.execution_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(instance_id = %$ctx.instance_id(), execution_id = $ctx.execution_id(), $($arg)+);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_is_a_no_op() {
        assert_eq!(init_logging(&LoggingConfig::default()), Ok(()));
    }

    #[test]
    fn bad_filter_is_reported() {
        let config = LoggingConfig {
            level: "not a [valid filter".into(),
            install_subscriber: true,
            ..LoggingConfig::default()
        };
        // RUST_LOG would take precedence over the configured level.
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(init_logging(&config).is_err());
        }
    }
}
