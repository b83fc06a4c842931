//! Runner program provisioning.
//!
//! The runner programs are static assets embedded at build time. Nothing
//! call-specific is ever interpolated into them; call data travels only as
//! the stdin payload.

use std::{collections::HashMap, fmt, sync::Arc};

use remote_sandbox_core::{RemoteError, RemoteResult, Transport};
use serde_json::json;

/// Directory on the remote host that receives the runner programs.
pub const REMOTE_TEMP_DIR: &str = "/tmp";

const CODE_RUNNER: &str = include_str!("runners/code_runner.cjs");
const FUNCTION_RUNNER: &str = include_str!("runners/function_runner.cjs");

/// Which runner program a call needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerKind {
    Code,
    Function,
}

impl RunnerKind {
    /// Program text.
    #[must_use]
    pub const fn source(self) -> &'static str {
        match self {
            Self::Code => CODE_RUNNER,
            Self::Function => FUNCTION_RUNNER,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Function => "function",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Uploads runner programs on first use and remembers where they live.
///
/// Concurrent first use of the same kind may upload twice; the last
/// completed upload is the one remembered.
pub struct RunnerProvisioner {
    transport: Arc<dyn Transport>,
    temp_dir: String,
    paths: std::sync::Mutex<HashMap<RunnerKind, String>>,
}

impl RunnerProvisioner {
    /// Create a provisioner uploading into [`REMOTE_TEMP_DIR`].
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_temp_dir(transport, REMOTE_TEMP_DIR)
    }

    /// Create a provisioner uploading into `temp_dir`.
    pub fn with_temp_dir(transport: Arc<dyn Transport>, temp_dir: impl Into<String>) -> Self {
        Self {
            transport,
            temp_dir: temp_dir.into().trim_end_matches('/').to_string(),
            paths: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn paths(&self) -> std::sync::MutexGuard<'_, HashMap<RunnerKind, String>> {
        self.paths
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Remote path of an already provisioned runner.
    #[must_use]
    pub fn cached(&self, kind: RunnerKind) -> Option<String> {
        self.paths().get(&kind).cloned()
    }

    /// Return the remote path of the `kind` runner, uploading it first if
    /// this session has not done so yet.
    ///
    /// # Errors
    /// Returns `ExecutionError` if the upload fails; nothing is remembered
    /// in that case, so the next call retries.
    pub async fn ensure_runner(&self, kind: RunnerKind) -> RemoteResult<String> {
        if let Some(path) = self.cached(kind) {
            return Ok(path);
        }

        let path = format!(
            "{}/remote-sandbox-{}-{}.cjs",
            self.temp_dir,
            kind.label(),
            uuid::Uuid::new_v4().simple()
        );

        tracing::debug!(%kind, remote_path = %path, "Uploading runner program");
        self.transport
            .write_file(&path, kind.source().as_bytes())
            .await
            .map_err(|e| {
                RemoteError::execution(format!("Failed to upload {kind} runner: {e}"))
                    .with_details(json!({ "remotePath": path }))
            })?;

        self.paths().insert(kind, path.clone());
        Ok(path)
    }

    /// Every runner path provisioned so far.
    #[must_use]
    pub fn provisioned(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.paths().values().cloned().collect();
        paths.sort();
        paths
    }

    /// Forget provisioned runners without touching the remote host.
    pub fn reset(&self) {
        self.paths().clear();
    }

    /// Best-effort removal of provisioned runners from the remote host.
    pub async fn cleanup(&self) {
        let paths = self.provisioned();
        self.reset();
        if paths.is_empty() {
            return;
        }

        let quoted: Vec<String> = paths
            .iter()
            .filter_map(|p| shlex::try_quote(p).ok().map(|q| q.into_owned()))
            .collect();
        let command = format!("rm -f {}", quoted.join(" "));

        match self.transport.exec(&command).await {
            Ok(channel) => {
                if let Err(e) = channel.run(&[]).await {
                    tracing::debug!("Runner cleanup failed: {e}");
                }
            }
            Err(e) => tracing::debug!("Runner cleanup skipped: {e}"),
        }
    }
}
