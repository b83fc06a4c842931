//! Observers for remote log events.

use std::{collections::VecDeque, sync::RwLock};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{LogEvent, LogLevel};

/// Provenance marker attached to every forwarded remote log line.
pub const REMOTE_MARKER: &str = "[REMOTE]";

/// Default number of events kept for late subscribers.
const HISTORY_LEN: usize = 1024;

/// Receives log events produced by remote code.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: &LogEvent);
}

/// Re-emits remote log events as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn emit(&self, event: &LogEvent) {
        let message = event.message();
        match event.level {
            LogLevel::Error => {
                tracing::error!(target: "remote_sandbox::remote", "{REMOTE_MARKER} {message}");
            }
            LogLevel::Warn => {
                tracing::warn!(target: "remote_sandbox::remote", "{REMOTE_MARKER} {message}");
            }
            LogLevel::Info | LogLevel::Log => {
                tracing::info!(target: "remote_sandbox::remote", "{REMOTE_MARKER} {message}");
            }
        }
    }
}

/// Broadcast + history store for remote log events.
///
/// New subscribers receive the retained history, then live events.
pub struct LogStore {
    history: RwLock<VecDeque<LogEvent>>,
    capacity: usize,
    sender: broadcast::Sender<LogEvent>,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore {
    /// Create a store retaining the default history length.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_LEN)
    }

    /// Create a store retaining at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(32))),
            capacity,
            sender,
        }
    }

    /// Push an event to live listeners and history.
    pub fn push(&self, event: LogEvent) {
        let _ = self.sender.send(event.clone());

        let Ok(mut history) = self.history.write() else {
            return;
        };
        if self.capacity == 0 {
            return;
        }
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> Vec<LogEvent> {
        self.history
            .read()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the retained history.
    pub fn clear(&self) {
        if let Ok(mut history) = self.history.write() {
            history.clear();
        }
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, LogEvent> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

impl LogSink for LogStore {
    fn emit(&self, event: &LogEvent) {
        self.push(event.clone());
    }
}
