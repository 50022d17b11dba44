//! Where worker output goes.
//!
//! Every call to `OutputSink::write` carries exactly one framed line, so lines
//! from different hosts may interleave but are never split.

use std::io::Write;
use std::sync::Mutex;

use colored::Colorize;
use colourado::Color;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

pub trait OutputSink: Send + Sync {
    fn write(&self, stream: Stream, bytes: &[u8]);
}

/// Writes to the real process stdout/stderr.
#[derive(Debug, Default)]
pub struct StdioSink;

impl OutputSink for StdioSink {
    fn write(&self, stream: Stream, bytes: &[u8]) {
        // Holding the lock for the whole write keeps one line in one piece.
        let result = match stream {
            Stream::Stdout => {
                let mut guard = std::io::stdout().lock();
                guard.write_all(bytes).and_then(|_| guard.flush())
            }
            Stream::Stderr => {
                let mut guard = std::io::stderr().lock();
                guard.write_all(bytes).and_then(|_| guard.flush())
            }
        };
        if let Err(e) = result {
            tracing::warn!("failed to write {:?}: {}", stream, e);
        }
    }
}

/// Collects lines in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(Stream, Vec<u8>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Stream, Vec<u8>)> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Lines written to one stream, lossily decoded.
    pub fn text(&self, stream: Stream) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, bytes)| String::from_utf8_lossy(&bytes).into_owned())
            .collect()
    }
}

impl OutputSink for MemorySink {
    fn write(&self, stream: Stream, bytes: &[u8]) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((stream, bytes.to_vec()));
    }
}

/// The `host: ` prefix put in front of every line of a host.
#[derive(Debug, Clone, Default)]
pub struct Label(Option<String>);

impl Label {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn plain(host: &str) -> Self {
        Self(Some(format!("{}: ", host)))
    }

    /// Colors the hostname with a palette color.
    pub fn colored(host: &str, color: Color) -> Self {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        Self(Some(format!("{}: ", host.truecolor(r, g, b))))
    }

    /// Builds one output record: label followed by the line bytes.
    pub fn frame(&self, line: &[u8]) -> Vec<u8> {
        match &self.0 {
            Some(prefix) => {
                let mut framed = Vec::with_capacity(prefix.len() + line.len());
                framed.extend_from_slice(prefix.as_bytes());
                framed.extend_from_slice(line);
                framed
            }
            None => line.to_vec(),
        }
    }
}

/// Writes `<host>: <message>` to the error stream.
pub fn report_error(sink: &dyn OutputSink, host: &str, message: &str) {
    sink.write(Stream::Stderr, format!("{}: {}\n", host, message).as_bytes());
}
