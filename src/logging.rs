//! Subscriber setup for a connector process
//!
//! Each participant writes its own rolling file, `<participant>.<log_file>`,
//! so two connectors sharing a log directory never interleave. Text mode
//! mirrors everything to stdout; JSON mode writes the file only.

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{AppConfig, LogRotation};

/// Crates whose info output drowns the engine's own
const QUIET_TARGETS: &[&str] = &["sqlx=warn", "tokio_util=warn"];

/// Install the global subscriber; keep the guard alive until shutdown or
/// buffered file output is lost
pub fn init_logging(config: &AppConfig) -> anyhow::Result<WorkerGuard> {
    let mut builder = RollingFileAppender::builder()
        .rotation(rotation(config.rotation))
        .filename_prefix(file_prefix(&config.participant_id))
        .filename_suffix(&config.log_file);
    if let Some(max) = config.max_log_files {
        builder = builder.max_log_files(max);
    }
    let file_appender = builder
        .build(&config.log_dir)
        .with_context(|| format!("open log directory {}", config.log_dir))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.log_level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).try_init()?;
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).try_init()?;
    }

    Ok(guard)
}

fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

fn default_directives(level: &str) -> String {
    std::iter::once(level)
        .chain(QUIET_TARGETS.iter().copied())
        .collect::<Vec<_>>()
        .join(",")
}

/// Participant ids are URIs or DIDs in practice; keep the file name portable
fn file_prefix(participant_id: &str) -> String {
    let prefix: String = participant_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if prefix.is_empty() {
        "connector".to_string()
    } else {
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_prefix_is_portable() {
        assert_eq!(file_prefix("consumer"), "consumer");
        assert_eq!(file_prefix("did:web:provider.example"), "did_web_provider_example");
        assert_eq!(file_prefix(""), "connector");
    }

    #[test]
    fn test_default_directives_quiet_sqlx() {
        assert_eq!(default_directives("debug"), "debug,sqlx=warn,tokio_util=warn");
        // every directive parses
        assert!(EnvFilter::try_new(default_directives("info")).is_ok());
    }
}
