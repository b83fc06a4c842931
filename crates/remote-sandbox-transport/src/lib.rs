//! OpenSSH transport for remote sandbox execution.
//!
//! Provides:
//! - `OpenSshTransport` - One ControlMaster connection, one `ssh` client per channel
//! - `SshTarget` - Argument building for the `ssh` binary
//! - Executable resolution and shell quoting utilities

pub mod command;
pub mod openssh;
pub mod resolve;

pub use command::{CommandBuildError, SshTarget, quote};
pub use openssh::OpenSshTransport;
pub use resolve::resolve_executable_path;
