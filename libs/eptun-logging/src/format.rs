//! Custom [`FormatEvent`] rendering `[LEVEL] target: message fields...`
//! with no timestamp.
//!
//! Adapted from the teacher's `Format`, which defaults to prefixing an
//! ISO8601 timestamp. The core here never emits timestamps, so the
//! timestamp branch is dropped entirely rather than toggled off at
//! construction time.

use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields},
    registry::LookupSpan,
};

/// Renders events as `[LEVEL] target: message field=value ...`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Format;

impl Format {
    pub fn new() -> Self {
        Self
    }
}

impl<S, N> FormatEvent<S, N> for Format
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();

        write!(writer, "[{}] ", level_tag(*meta.level()))?;
        write!(writer, "{}: ", meta.target())?;

        ctx.format_fields(writer.by_ref(), event)?;

        for span in ctx
            .event_scope()
            .into_iter()
            .flat_map(tracing_subscriber::registry::Scope::from_root)
        {
            let exts = span.extensions();
            if let Some(fields) = exts.get::<FormattedFields<N>>() {
                if !fields.is_empty() {
                    write!(writer, " {}", fields.fields)?;
                }
            }
        }

        writeln!(writer)
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARN",
        Level::ERROR => "ERROR",
    }
}
