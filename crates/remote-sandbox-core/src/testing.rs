//! Scripted in-memory transport for tests.
//!
//! Every process channel reads its whole stdin, hands `(command, stdin)` to
//! a handler closure and replays the returned output and exit code.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{broadcast, oneshot},
};

use crate::{
    CallRequest, ProcessChannel, ResultEnvelope, Transport, TransportError, TransportEvent,
    ValidatedConfig,
};

const PIPE_CAPACITY: usize = 64 * 1024;

/// What a scripted process channel produces.
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

impl MockReply {
    /// Successful exit with the given stdout.
    pub fn stdout(out: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: out.into(),
            exit_code: Some(0),
            ..Self::default()
        }
    }

    /// A runner that printed `envelope` and exited cleanly.
    #[must_use]
    pub fn envelope(envelope: &ResultEnvelope) -> Self {
        Self::stdout(format!("{}\n", envelope.to_json()))
    }

    /// Non-zero exit with the given stderr.
    pub fn failed(stderr: impl Into<Vec<u8>>, code: i32) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: Some(code),
            ..Self::default()
        }
    }

    /// Append diagnostic output.
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr.extend(stderr.into());
        self
    }
}

type Handler = dyn Fn(&str, &[u8]) -> MockReply + Send + Sync;

/// One recorded process channel.
#[derive(Debug, Clone, Default)]
pub struct ExecRecord {
    pub command: String,
    pub stdin: Vec<u8>,
}

impl ExecRecord {
    /// Decode the stdin payload as a call request.
    #[must_use]
    pub fn call(&self) -> Option<CallRequest> {
        serde_json::from_slice(&self.stdin).ok()
    }
}

#[derive(Default)]
struct MockState {
    connected: bool,
    connects: usize,
    disconnects: usize,
    execs: Vec<ExecRecord>,
    writes: usize,
    failing_writes: usize,
    files: HashMap<String, Vec<u8>>,
}

/// Scripted transport.
pub struct MockTransport {
    handler: Arc<Handler>,
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<TransportEvent>,
    connect_delay: Duration,
    connect_error: Option<TransportError>,
    reject_exec: bool,
}

impl MockTransport {
    /// Create a transport whose channels are answered by `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &[u8]) -> MockReply + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(16);
        Self {
            handler: Arc::new(handler),
            state: Arc::new(Mutex::new(MockState::default())),
            events,
            connect_delay: Duration::ZERO,
            connect_error: None,
            reject_exec: false,
        }
    }

    /// Delay every connect attempt.
    #[must_use]
    pub const fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Fail every connect attempt with `err`.
    #[must_use]
    pub fn with_connect_error(mut self, err: TransportError) -> Self {
        self.connect_error = Some(err);
        self
    }

    /// Reject every exec request.
    #[must_use]
    pub const fn rejecting_exec(mut self) -> Self {
        self.reject_exec = true;
        self
    }

    /// Fail the next `n` file writes.
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().failing_writes = n;
    }

    /// Broadcast a connection-state notification.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Put a file on the fake remote host.
    pub fn put_file(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.lock().files.insert(path.into(), bytes.into());
    }

    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Number of successful file writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    /// Channels opened so far, in order.
    #[must_use]
    pub fn execs(&self) -> Vec<ExecRecord> {
        self.lock().execs.clone()
    }

    /// Decoded call payloads of every channel that received one.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRequest> {
        self.execs().iter().filter_map(ExecRecord::call).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _config: &ValidatedConfig) -> Result<(), TransportError> {
        self.lock().connects += 1;
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(err) = &self.connect_error {
            return Err(err.clone());
        }
        self.lock().connected = true;
        self.emit(TransportEvent::Ready);
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ProcessChannel, TransportError> {
        if !self.lock().connected {
            return Err(TransportError::NotConnected);
        }
        if self.reject_exec {
            return Err(TransportError::Exec(format!("exec rejected: {command}")));
        }

        let (stdin_w, mut stdin_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut stdout_w, stdout_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut stderr_w, stderr_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (closed_tx, closed_rx) = oneshot::channel();

        let handler = Arc::clone(&self.handler);
        let state = Arc::clone(&self.state);
        let command = command.to_string();

        tokio::spawn(async move {
            let mut stdin = Vec::new();
            let _ = stdin_r.read_to_end(&mut stdin).await;

            let reply = handler(&command, &stdin);
            if let Ok(mut state) = state.lock() {
                state.execs.push(ExecRecord { command, stdin });
            }

            let (_, _) = tokio::join!(
                stdout_w.write_all(&reply.stdout),
                stderr_w.write_all(&reply.stderr)
            );
            drop(stdout_w);
            drop(stderr_w);
            let _ = closed_tx.send(reply.exit_code);
        });

        Ok(ProcessChannel {
            stdin: Box::pin(stdin_w),
            stdout: Box::pin(stdout_r),
            stderr: Box::pin(stderr_r),
            closed: closed_rx.map(|code| code.ok().flatten()).boxed(),
        })
    }

    async fn write_file(&self, remote_path: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(TransportError::Transfer(format!(
                "write to {remote_path} failed"
            )));
        }
        state.writes += 1;
        state.files.insert(remote_path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read_file(&self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        let state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state
            .files
            .get(remote_path)
            .cloned()
            .ok_or_else(|| TransportError::Transfer(format!("No such file: {remote_path}")))
    }

    async fn disconnect(&self) {
        {
            let mut state = self.lock();
            state.connected = false;
            state.disconnects += 1;
        }
        self.emit(TransportEvent::Closed);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
