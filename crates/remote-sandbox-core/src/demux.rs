//! Diagnostic stream demultiplexing.
//!
//! Runners with log streaming enabled write console calls to stderr as
//! `<LOG_SENTINEL>{"type":..,"args":[..]}` lines. Everything else on stderr
//! is genuine diagnostic text.

use std::sync::Arc;

use crate::{LogEvent, LogSink};

/// Prefix marking a diagnostic line as a log event.
pub const LOG_SENTINEL: &str = "__REMOTE_SANDBOX_LOG__";

/// Incremental splitter for a diagnostic stream.
///
/// Log events are forwarded to the sink as soon as their line completes.
#[derive(Default)]
pub struct LogDemux {
    sink: Option<Arc<dyn LogSink>>,
    pending: Vec<u8>,
    events: Vec<LogEvent>,
    residual: Vec<String>,
}

impl LogDemux {
    /// Create a demultiplexer that forwards events to `sink`.
    #[must_use]
    pub fn new(sink: Option<Arc<dyn LogSink>>) -> Self {
        Self {
            sink,
            ..Self::default()
        }
    }

    /// Feed a chunk of raw bytes; complete lines are processed immediately.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.push_line(&String::from_utf8_lossy(&line[..pos]));
        }
    }

    /// Process one complete line (without its terminator).
    ///
    /// A sentinel line counts as a log event only when its payload matches
    /// the event shape, an object with a known `type` and an `args` array.
    /// Any other payload, even valid JSON, is dropped.
    pub fn push_line(&mut self, line: &str) {
        let line = line.strip_suffix('\r').unwrap_or(line);

        let Some(rest) = line.strip_prefix(LOG_SENTINEL) else {
            self.residual.push(line.to_string());
            return;
        };

        match serde_json::from_str::<LogEvent>(rest) {
            Ok(event) => {
                if let Some(sink) = &self.sink {
                    sink.emit(&event);
                }
                self.events.push(event);
            }
            Err(e) => {
                tracing::trace!("Dropping malformed log line: {e}");
            }
        }
    }

    /// Flush any unterminated line and return `(events, residual_text)`.
    #[must_use]
    pub fn finish(mut self) -> (Vec<LogEvent>, String) {
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.push_line(&String::from_utf8_lossy(&tail));
        }
        let residual = self.residual.join("\n").trim().to_string();
        (self.events, residual)
    }
}

/// Split a complete diagnostic stream into log events and residual text.
#[must_use]
pub fn demux(diagnostic: &[u8]) -> (Vec<LogEvent>, String) {
    let mut demux = LogDemux::default();
    demux.feed(diagnostic);
    demux.finish()
}
