//! Bridges formatted log lines onto the two abstract text sinks the core
//! is handed at startup, instead of a file or the Windows Event Log the
//! way the teacher's `logging` crate does.

use std::fmt;
use std::io;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// A destination for a single rendered log line.
///
/// The CLI entry point supplies a stdout- and a stderr-backed sink; a GUI
/// front-end (out of scope here) would supply its own.
pub trait TextSink: Send + Sync + fmt::Debug {
    fn write_line(&self, line: &str);
}

#[derive(Debug, Clone, Default)]
pub struct StdoutSink;

impl TextSink for StdoutSink {
    fn write_line(&self, line: &str) {
        println!("{line}");
    }
}

#[derive(Debug, Clone, Default)]
pub struct StderrSink;

impl TextSink for StderrSink {
    fn write_line(&self, line: &str) {
        eprintln!("{line}");
    }
}

#[derive(Clone)]
pub struct SinkMakeWriter {
    sink: Arc<dyn TextSink>,
}

impl SinkMakeWriter {
    pub fn new(sink: Arc<dyn TextSink>) -> Self {
        Self { sink }
    }
}

impl<'a> MakeWriter<'a> for SinkMakeWriter {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter {
            sink: self.sink.clone(),
            buf: String::new(),
        }
    }
}

/// Buffers one event's formatted bytes and forwards them as a single line
/// to the sink when the writer is dropped at the end of that event.
pub struct LineWriter {
    sink: Arc<dyn TextSink>,
    buf: String,
}

impl io::Write for LineWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let s = std::str::from_utf8(data).map_err(io::Error::other)?;
        self.buf.push_str(s);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let line = self.buf.trim_end_matches('\n');
        if !line.is_empty() {
            self.sink.write_line(line);
        }
    }
}
