//! Global subscriber setup for the orchestrator.
//!
//! Grounded on the teacher's `firezone_logging::setup_global_subscriber`,
//! stripped of file rotation, the Windows Event Log sink, and Sentry —
//! none of those are in scope here. What's left: an `EnvFilter` driven by
//! a single configured level, and a bracket-tagged, timestamp-free
//! formatter split across two text sinks by severity.

mod format;
mod sink;

pub use format::Format;
pub use sink::{SinkMakeWriter, StderrSink, StdoutSink, TextSink};

use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::filter_fn, EnvFilter};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to install global subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// One of the four levels a `logging.windowLevel`/`logging.fileLevel`
/// config field may hold, plus the two spellings that disable the filter.
pub fn level_to_directive(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "ERROR" => "error",
        "WARN" => "warn",
        "INFO" => "info",
        "OFF" | "NONE" => "off",
        _ => "info",
    }
}

/// Installs the process-wide subscriber. Must be called exactly once, by
/// the binary entry point — never by a library crate.
pub fn setup_global_subscriber(
    window_level: &str,
    info_sink: Arc<dyn TextSink>,
    error_sink: Arc<dyn TextSink>,
) -> Result<(), LoggingError> {
    let directive = level_to_directive(window_level);
    let env_filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let info_layer = tracing_subscriber::fmt::layer()
        .event_format(Format::new())
        .with_writer(SinkMakeWriter::new(info_sink))
        .with_filter(filter_fn(|meta| {
            matches!(*meta.level(), Level::INFO | Level::DEBUG | Level::TRACE)
        }));

    let error_layer = tracing_subscriber::fmt::layer()
        .event_format(Format::new())
        .with_writer(SinkMakeWriter::new(error_sink))
        .with_filter(filter_fn(|meta| {
            matches!(*meta.level(), Level::WARN | Level::ERROR)
        }));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(info_layer)
        .with(error_layer)
        .try_init()?;

    Ok(())
}

/// Installs a capturing subscriber for the duration of one test and
/// returns a guard that restores the previous default on drop.
///
/// Mirrors the teacher's `firezone_logging::test` helper.
pub fn test(directives: &str) -> tracing::subscriber::DefaultGuard {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(LevelFilter::DEBUG.to_string()));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().event_format(Format::new()).with_test_writer());

    tracing::subscriber::set_default(subscriber)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_directive_mapping() {
        assert_eq!(level_to_directive("warn"), "warn");
        assert_eq!(level_to_directive("NONE"), "off");
        assert_eq!(level_to_directive("OFF"), "off");
        assert_eq!(level_to_directive("bogus"), "info");
    }

    #[test]
    fn can_install_and_emit_under_test_subscriber() {
        let _guard = test("debug");
        tracing::info!(answer = 42, "hello from a test");
        tracing::warn!("a warning line");
    }
}
