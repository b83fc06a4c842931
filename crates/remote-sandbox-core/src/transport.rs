//! Transport collaborator traits.
//!
//! A transport owns one authenticated connection to the remote host and
//! hands out process channels over it. Authentication, encryption and
//! wire-level multiplexing are the implementation's concern.

use std::pin::Pin;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::broadcast,
};

use crate::{RemoteError, ValidatedConfig};

/// Transport error.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Connection timed out after {0} ms")]
    Timeout(u128),
    #[error("Not connected")]
    NotConnected,
    #[error("Exec request rejected: {0}")]
    Exec(String),
    #[error("Transfer failed: {0}")]
    Transfer(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<TransportError> for RemoteError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect(_) | TransportError::Timeout(_) => {
                Self::connection(err.to_string())
            }
            TransportError::NotConnected => Self::not_connected(),
            TransportError::Exec(_) | TransportError::Io(_) => Self::execution(err.to_string()),
            TransportError::Transfer(_) => Self::unknown(err.to_string()),
        }
    }
}

/// Connection-state notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is usable.
    Ready,
    /// The connection failed after being established.
    Error(String),
    /// The remote side ended the connection.
    End,
    /// The connection is gone.
    Closed,
}

/// A remote command execution unit.
///
/// `closed` fires once, after the remote command exits, with its exit code
/// (`None` when the command was terminated by a signal or the code was lost).
pub struct ProcessChannel {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
    pub stderr: Pin<Box<dyn AsyncRead + Send>>,
    pub closed: BoxFuture<'static, Option<i32>>,
}

impl std::fmt::Debug for ProcessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessChannel").finish_non_exhaustive()
    }
}

/// Everything a process channel produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

impl ChannelOutput {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

impl ProcessChannel {
    /// Write `input`, close the input stream and collect both output streams
    /// until the channel closes.
    ///
    /// # Errors
    /// Returns error if reading an output stream fails.
    pub async fn run(self, input: &[u8]) -> Result<ChannelOutput, TransportError> {
        self.run_with(input, |_| {}).await
    }

    /// Like [`run`](Self::run), handing every diagnostic chunk to `on_stderr`
    /// as it arrives.
    ///
    /// # Errors
    /// Returns error if reading an output stream fails.
    pub async fn run_with<F>(self, input: &[u8], mut on_stderr: F) -> Result<ChannelOutput, TransportError>
    where
        F: FnMut(&[u8]) + Send,
    {
        let Self {
            mut stdin,
            mut stdout,
            mut stderr,
            closed,
        } = self;

        let write = async move {
            // The remote side may exit before consuming its input.
            if let Err(e) = stdin.write_all(input).await {
                tracing::debug!("Channel input not fully written: {e}");
            } else if let Err(e) = stdin.shutdown().await {
                tracing::debug!("Failed to close channel input: {e}");
            }
        };

        let read_out = async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        };

        let read_err = async {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                let n = stderr.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                on_stderr(&chunk[..n]);
                buf.extend_from_slice(&chunk[..n]);
            }
            Ok::<_, std::io::Error>(buf)
        };

        let ((), out, err) = tokio::join!(write, read_out, read_err);
        let (stdout, stderr) = (out?, err?);
        let exit_code = closed.await;

        Ok(ChannelOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

/// Trait for transport collaborators.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection described by `config`.
    ///
    /// The caller enforces the overall connect timeout; implementations may
    /// use `config.connect_timeout` / `config.ready_timeout` internally.
    async fn connect(&self, config: &ValidatedConfig) -> Result<(), TransportError>;

    /// Open a process channel running `command` on the remote host.
    async fn exec(&self, command: &str) -> Result<ProcessChannel, TransportError>;

    /// Write `bytes` to `remote_path`, creating parent directories.
    async fn write_file(&self, remote_path: &str, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read the whole file at `remote_path`.
    async fn read_file(&self, remote_path: &str) -> Result<Vec<u8>, TransportError>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self);

    /// Subscribe to connection-state notifications.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
