//! The session façade.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
};

use async_trait::async_trait;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use remote_sandbox_core::{
    LogSink, RemoteError, RemoteResult, SandboxConfig, TracingLogSink, Transport, TransportEvent,
    ValidatedConfig,
};
use remote_sandbox_executor::{CallExecutor, CallSettings, FunctionInvoker};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

use crate::proxy::ModuleHandle;

type ConnectAttempt = Shared<BoxFuture<'static, RemoteResult<()>>>;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Output of a shell command run in the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Everything that lives exactly as long as one connection.
struct Session {
    config: ValidatedConfig,
    executor: Arc<CallExecutor>,
    modules: Mutex<HashMap<String, Arc<ModuleHandle>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn modules(&self) -> MutexGuard<'_, HashMap<String, Arc<ModuleHandle>>> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(watcher) = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
    }
}

enum State {
    Disconnected,
    Connecting(ConnectAttempt),
    Connected(Arc<Session>),
}

struct Inner {
    config: SandboxConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    sink: RwLock<Arc<dyn LogSink>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sink(&self) -> Arc<dyn LogSink> {
        self.sink
            .read()
            .map_or_else(|_| Arc::new(TracingLogSink) as Arc<dyn LogSink>, |s| Arc::clone(&s))
    }

    fn current(&self) -> RemoteResult<Arc<Session>> {
        match &*self.state() {
            State::Connected(session) => Ok(Arc::clone(session)),
            _ => Err(RemoteError::not_connected()),
        }
    }

    /// Drop `session` if it is still the current one.
    fn invalidate(&self, session: &Arc<Session>) -> bool {
        let mut state = self.state();
        if matches!(&*state, State::Connected(current) if Arc::ptr_eq(current, session)) {
            *state = State::Disconnected;
            true
        } else {
            false
        }
    }
}

/// Invoker behind module handles. Each call goes through whichever
/// session is current when it is made, so a handle kept across a
/// disconnect fails with `NotConnected` and one kept across a reconnect
/// uses the new session's runners.
struct SessionInvoker {
    inner: Weak<Inner>,
}

#[async_trait]
impl FunctionInvoker for SessionInvoker {
    async fn invoke_function(
        &self,
        module_path: &str,
        function_name: &str,
        args: Vec<Value>,
    ) -> RemoteResult<Value> {
        let inner = self.inner.upgrade().ok_or_else(RemoteError::not_connected)?;
        let session = inner.current()?;
        session
            .executor
            .call_function(module_path, function_name, args)
            .await
    }
}

/// Client for one remote sandbox.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct SandboxClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SandboxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxClient")
            .field("host", &self.inner.config.host)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SandboxClient {
    /// Create a client that reaches the host through `transport`.
    #[must_use]
    pub fn new(config: SandboxConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                state: Mutex::new(State::Disconnected),
                sink: RwLock::new(Arc::new(TracingLogSink)),
            }),
        }
    }

    /// Create a client using the system OpenSSH client.
    #[cfg(feature = "openssh")]
    #[must_use]
    pub fn ssh(config: SandboxConfig) -> Self {
        Self::new(
            config,
            Arc::new(remote_sandbox_transport::OpenSshTransport::new()),
        )
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match &*self.inner.state() {
            State::Disconnected => ConnectionState::Disconnected,
            State::Connecting(_) => ConnectionState::Connecting,
            State::Connected(_) => ConnectionState::Connected,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect, or join the attempt already in flight.
    ///
    /// # Errors
    /// Returns `ValidationError` for a bad configuration, `ConnectionError`
    /// if the transport fails or the attempt times out, and `CommandError`
    /// if the pre-build command exits non-zero.
    pub async fn connect(&self) -> RemoteResult<()> {
        let config = self.inner.config.validate()?;

        let attempt = {
            let mut state = self.inner.state();
            match &*state {
                State::Connected(_) => return Ok(()),
                State::Connecting(attempt) => attempt.clone(),
                State::Disconnected => {
                    let task = tokio::spawn(establish(Arc::clone(&self.inner), config));
                    let attempt = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(RemoteError::unknown(format!("Connect task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *state = State::Connecting(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Close the connection, removing provisioned runners on the way out.
    /// Does nothing when already disconnected.
    pub async fn disconnect(&self) {
        let session = loop {
            let pending = {
                let mut state = self.inner.state();
                match std::mem::replace(&mut *state, State::Disconnected) {
                    State::Disconnected => return,
                    State::Connected(session) => break session,
                    State::Connecting(attempt) => {
                        *state = State::Connecting(attempt.clone());
                        attempt
                    }
                }
            };
            // Settle the attempt first so it cannot resurrect the session.
            let _ = pending.await;
        };

        tracing::info!(host = %session.config.host, "Disconnecting");
        session.executor.provisioner().cleanup().await;
        session.modules().clear();
        self.inner.transport.disconnect().await;
    }

    fn session(&self) -> RemoteResult<Arc<Session>> {
        self.inner.current()
    }

    /// Evaluate `code` in the sandbox.
    ///
    /// # Errors
    /// Returns `NotConnected` before connect, otherwise the decoded
    /// remote error.
    pub async fn run_code(&self, code: &str) -> RemoteResult<Value> {
        self.session()?.executor.run_code(code).await
    }

    /// Call `function_name` exported by `module_path`.
    ///
    /// # Errors
    /// Returns `NotConnected` before connect, otherwise the decoded
    /// remote error.
    pub async fn call_function(
        &self,
        module_path: &str,
        function_name: &str,
        args: Vec<Value>,
    ) -> RemoteResult<Value> {
        self.session()?
            .executor
            .call_function(module_path, function_name, args)
            .await
    }

    /// Handle for the module at `module_path`, memoized per session.
    ///
    /// # Errors
    /// Returns `NotConnected` before connect.
    pub fn module(&self, module_path: &str) -> RemoteResult<Arc<ModuleHandle>> {
        let session = self.session()?;
        let mut modules = session.modules();
        let handle = modules.entry(module_path.to_string()).or_insert_with(|| {
            let invoker: Arc<dyn FunctionInvoker> = Arc::new(SessionInvoker {
                inner: Arc::downgrade(&self.inner),
            });
            Arc::new(ModuleHandle::new(module_path, invoker))
        });
        Ok(Arc::clone(handle))
    }

    /// Forget every memoized module handle.
    ///
    /// # Errors
    /// Returns `NotConnected` before connect.
    pub fn clear_module_cache(&self) -> RemoteResult<()> {
        self.session()?.modules().clear();
        Ok(())
    }

    /// Run a shell command inside the sandbox directory.
    ///
    /// # Errors
    /// Returns `CommandError` if the command cannot be started or exits
    /// non-zero; `details` then carries its output and exit code.
    pub async fn run_command(&self, command: &str) -> RemoteResult<CommandOutput> {
        let session = self.session()?;
        run_in_sandbox(
            self.inner.transport.as_ref(),
            &session.config.sandbox_path,
            command,
        )
        .await
    }

    /// Copy a local file to the remote host.
    ///
    /// # Errors
    /// Returns `UploadError` if the local file cannot be read or the
    /// transfer fails.
    pub async fn upload_file(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
    ) -> RemoteResult<()> {
        let session = self.session()?;
        let local_path = local_path.as_ref();
        let remote_path = resolve_remote(&session.config.sandbox_path, remote_path);

        let bytes = tokio::fs::read(local_path).await.map_err(|e| {
            let message = if e.kind() == std::io::ErrorKind::NotFound {
                format!("Local file not found: {}", local_path.display())
            } else {
                format!("Failed to read {}: {e}", local_path.display())
            };
            RemoteError::upload(message)
        })?;

        tracing::debug!(local = %local_path.display(), remote = %remote_path, bytes = bytes.len(), "Uploading file");
        self.inner
            .transport
            .write_file(&remote_path, &bytes)
            .await
            .map_err(|e| {
                RemoteError::upload(format!("Failed to upload to {remote_path}: {e}"))
                    .with_details(json!({ "remotePath": remote_path }))
            })
    }

    /// Copy a remote file to the local filesystem, creating parent
    /// directories.
    ///
    /// # Errors
    /// Returns `DownloadError` if the transfer or the local write fails.
    pub async fn download_file(
        &self,
        remote_path: &str,
        local_path: impl AsRef<Path>,
    ) -> RemoteResult<()> {
        let session = self.session()?;
        let local_path = local_path.as_ref();
        let remote_path = resolve_remote(&session.config.sandbox_path, remote_path);

        let bytes = self
            .inner
            .transport
            .read_file(&remote_path)
            .await
            .map_err(|e| {
                RemoteError::download(format!("Failed to download {remote_path}: {e}"))
                    .with_details(json!({ "remotePath": remote_path }))
            })?;

        if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RemoteError::download(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        tokio::fs::write(local_path, &bytes).await.map_err(|e| {
            RemoteError::download(format!("Failed to write {}: {e}", local_path.display()))
        })
    }

    /// Replace the observer for remote log events. Applies to the current
    /// session and to every later one.
    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        if let Ok(mut current) = self.inner.sink.write() {
            *current = Arc::clone(&sink);
        }
        if let Ok(session) = self.session() {
            session.executor.set_log_sink(sink);
        }
    }
}

/// One connect attempt, run as its own task so that callers joining it can
/// drop their futures without cancelling it.
async fn establish(inner: Arc<Inner>, config: ValidatedConfig) -> RemoteResult<()> {
    let result = open_session(&inner, config).await;
    let mut state = inner.state();
    match result {
        Ok(session) => {
            *state = State::Connected(session);
            Ok(())
        }
        Err(err) => {
            *state = State::Disconnected;
            Err(err)
        }
    }
}

async fn open_session(inner: &Arc<Inner>, config: ValidatedConfig) -> RemoteResult<Arc<Session>> {
    // Readiness polling inside the transport is bounded by `ready_timeout`;
    // the whole attempt is bounded here.
    let budget = config.connect_timeout;
    tracing::info!(host = %config.host, port = config.port, user = %config.username, "Connecting");

    match tokio::time::timeout(budget, inner.transport.connect(&config)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(RemoteError::connection(e.to_string())),
        Err(_) => {
            inner.transport.disconnect().await;
            return Err(RemoteError::connection(format!(
                "Connection timed out after {} ms",
                budget.as_millis()
            )));
        }
    }

    if let Some(prebuild) = &config.prebuild_command {
        tracing::info!(command = %prebuild, "Running pre-build command");
        if let Err(err) = run_in_sandbox(inner.transport.as_ref(), &config.sandbox_path, prebuild).await {
            inner.transport.disconnect().await;
            return Err(RemoteError {
                message: format!("Pre-build command failed: {}", err.message),
                ..err
            });
        }
    }

    let executor = Arc::new(CallExecutor::new(
        Arc::clone(&inner.transport),
        CallSettings::from(&config),
    ));
    executor.set_log_sink(inner.sink());

    let session = Arc::new(Session {
        config,
        executor,
        modules: Mutex::new(HashMap::new()),
        watcher: Mutex::new(None),
    });
    let watcher = tokio::spawn(watch_transport(
        Arc::downgrade(inner),
        Arc::downgrade(&session),
        inner.transport.subscribe(),
    ));
    if let Ok(mut slot) = session.watcher.lock() {
        *slot = Some(watcher);
    }

    tracing::info!(host = %session.config.host, "Connected");
    Ok(session)
}

/// End the session when the transport reports the connection gone.
async fn watch_transport(
    inner: Weak<Inner>,
    session: Weak<Session>,
    mut events: tokio::sync::broadcast::Receiver<TransportEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                tracing::debug!("Missed {n} transport events");
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        match &event {
            TransportEvent::Ready => continue,
            TransportEvent::Error(e) => tracing::warn!("Transport error: {e}"),
            TransportEvent::End | TransportEvent::Closed => {
                tracing::info!(?event, "Transport connection ended");
            }
        }

        let (Some(inner), Some(session)) = (inner.upgrade(), session.upgrade()) else {
            return;
        };
        if inner.invalidate(&session) {
            session.executor.provisioner().reset();
            session.modules().clear();
        }
        break;
    }
}

/// Resolve a remote path against the sandbox directory unless absolute.
fn resolve_remote(sandbox_path: &str, remote_path: &str) -> String {
    if remote_path.starts_with('/') {
        remote_path.to_string()
    } else {
        format!("{sandbox_path}/{}", remote_path.trim_start_matches("./"))
    }
}

async fn run_in_sandbox(
    transport: &dyn Transport,
    sandbox_path: &str,
    command: &str,
) -> RemoteResult<CommandOutput> {
    let dir = shlex::try_quote(sandbox_path)
        .map_err(|e| RemoteError::command(format!("Invalid sandbox path: {e}")))?;
    let full = format!("cd {dir} && {command}");

    let channel = transport
        .exec(&full)
        .await
        .map_err(|e| RemoteError::command(format!("Failed to start command: {e}")))?;
    let output = channel
        .run(&[])
        .await
        .map_err(|e| RemoteError::command(format!("Command channel failed: {e}")))?;

    let output = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.exit_code,
    };
    if output.success() {
        return Ok(output);
    }

    let status = output
        .exit_code
        .map_or_else(|| "no exit status".to_string(), |c| format!("exit code {c}"));
    let stderr = output.stderr.trim();
    let message = if stderr.is_empty() {
        format!("Command failed with {status}")
    } else {
        format!("Command failed with {status}: {stderr}")
    };
    Err(RemoteError::command(message).with_details(json!(output)))
}
