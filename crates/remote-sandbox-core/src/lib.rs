//! Core types for remote sandbox execution.
//!
//! This crate provides the pieces shared by every other crate:
//! - `RemoteError` / `ErrorCode` - The public error taxonomy
//! - `SandboxConfig` - Connection and sandbox configuration
//! - `CallRequest` / `ResultEnvelope` / `LogEvent` - Wire protocol types
//! - `demux` / `decode` - Diagnostic stream splitting and envelope decoding
//! - `Transport` - The transport collaborator trait
//! - `LogStore` / `LogSink` - Observers for remote log events

pub mod config;
pub mod decode;
pub mod demux;
pub mod error;
pub mod log_store;
pub mod protocol;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{ConfigError, Credentials, SandboxConfig, ValidatedConfig};
pub use decode::decode;
pub use demux::{LOG_SENTINEL, LogDemux, demux};
pub use error::{ErrorCode, RemoteError, RemoteResult};
pub use log_store::{LogSink, LogStore, REMOTE_MARKER, TracingLogSink};
pub use protocol::{CallMode, CallRequest, LogEvent, LogLevel, RemoteFailure, ResultEnvelope};
pub use transport::{ChannelOutput, ProcessChannel, Transport, TransportError, TransportEvent};
