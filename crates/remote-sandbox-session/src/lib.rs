//! Session façade and transparent module proxies for remote sandboxes.
//!
//! Provides:
//! - `SandboxClient` - Connect lifecycle, calls, file transfer, shell commands
//! - `ModuleHandle` - A remote module whose functions are resolved on call
//! - `remote_call!` - Call-site sugar for module handles

pub mod client;
pub mod proxy;

pub use client::{CommandOutput, ConnectionState, SandboxClient};
pub use proxy::{ModuleHandle, RESERVED_NAMES, RemoteFunction};
pub use remote_sandbox_core::{ErrorCode, RemoteError, RemoteResult, SandboxConfig};
