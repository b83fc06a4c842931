//! Runner provisioning and call execution for remote sandboxes.
//!
//! Provides:
//! - `RunnerProvisioner` - Uploads the embedded runner programs once per session
//! - `invoke` - Runs one call payload over a process channel
//! - `CallExecutor` - The full pipeline: provision, invoke, demux, decode
//! - `FunctionInvoker` - Capability interface used by module handles

pub mod call;
pub mod executor;
pub mod runner;

#[cfg(test)]
mod node_tests;

pub use call::{RawCall, invoke, runner_command};
pub use executor::{CallExecutor, CallSettings, FunctionInvoker};
pub use runner::{RunnerKind, RunnerProvisioner};
