//! Transport backed by the system OpenSSH client.
//!
//! `connect` starts one `ssh -M -N` master process holding the authenticated
//! connection. Every channel is a short-lived `ssh -S <socket>` client that
//! multiplexes over the master, so channels never authenticate again.

use std::{
    io::Write as _,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::FutureExt;
use remote_sandbox_core::{
    Credentials, ProcessChannel, Transport, TransportError, TransportEvent, ValidatedConfig,
};
use tempfile::NamedTempFile;
use tokio::{
    io::AsyncReadExt,
    process::Command,
    sync::{Mutex, broadcast, oneshot},
};

use crate::{SshTarget, command::quote, resolve_executable_path};

/// Interval between control socket checks while the master starts up.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bytes of master stderr kept for error reports.
const STDERR_TAIL: usize = 4096;

struct Connection {
    program: PathBuf,
    target: SshTarget,
    shutdown_tx: Option<oneshot::Sender<()>>,
    monitor: tokio::task::JoinHandle<()>,
    // Kept alive for the lifetime of the connection.
    _key_file: Option<NamedTempFile>,
}

/// Transport using the `ssh` binary with ControlMaster multiplexing.
pub struct OpenSshTransport {
    ssh_program: String,
    connection: Mutex<Option<Connection>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for OpenSshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenSshTransport {
    /// Create a transport using `ssh` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_program("ssh")
    }

    /// Create a transport using a specific `ssh` executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            ssh_program: program.into(),
            connection: Mutex::new(None),
            events,
        }
    }

    async fn channel_target(&self) -> Result<(PathBuf, SshTarget), TransportError> {
        self.connection
            .lock()
            .await
            .as_ref()
            .filter(|c| !c.monitor.is_finished())
            .map(|c| (c.program.clone(), c.target.clone()))
            .ok_or(TransportError::NotConnected)
    }

    async fn run_remote(&self, command: &str, input: &[u8]) -> Result<Vec<u8>, TransportError> {
        let output = self.exec(command).await?.run(input).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(TransportError::Transfer(format!(
                "`{command}` exited with {:?}: {}",
                output.exit_code,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn write_key_file(key: &str) -> Result<NamedTempFile, TransportError> {
    // NamedTempFile is created with 0600 permissions on unix.
    let mut file = tempfile::Builder::new()
        .prefix("remote-sandbox-key-")
        .tempfile()?;
    file.write_all(key.as_bytes())?;
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(file)
}

fn control_path() -> PathBuf {
    let id = uuid::Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!("rs-{}.sock", &id[..12]))
}

fn spawn_stderr_tail(child: &mut AsyncGroupChild) -> Arc<StdMutex<String>> {
    let tail = Arc::new(StdMutex::new(String::new()));
    if let Some(mut stderr) = child.inner().stderr.take() {
        let tail = Arc::clone(&tail);
        tokio::spawn(async move {
            let mut chunk = [0u8; 1024];
            while let Ok(n) = stderr.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                if let Ok(mut tail) = tail.lock() {
                    tail.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    if tail.len() > STDERR_TAIL {
                        let cut = tail.len() - STDERR_TAIL;
                        let cut = (cut..tail.len())
                            .find(|&i| tail.is_char_boundary(i))
                            .unwrap_or(cut);
                        tail.drain(..cut);
                    }
                }
            }
        });
    }
    tail
}

fn read_tail(tail: &StdMutex<String>) -> String {
    tail.lock().map(|t| t.trim().to_string()).unwrap_or_default()
}

async fn master_is_ready(program: &Path, target: &SshTarget) -> bool {
    Command::new(program)
        .args(target.check_args())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

/// Poll the control socket until the master answers, exits, or time runs out.
async fn wait_until_ready(
    program: &Path,
    target: &SshTarget,
    child: &mut AsyncGroupChild,
    tail: &StdMutex<String>,
    ready_timeout: Duration,
) -> Result<(), TransportError> {
    let deadline = Instant::now() + ready_timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            // Give the stderr reader a moment to drain.
            tokio::time::sleep(Duration::from_millis(20)).await;
            let stderr = read_tail(tail);
            return Err(TransportError::Connect(if stderr.is_empty() {
                format!("ssh exited with {status}")
            } else {
                stderr
            }));
        }
        if master_is_ready(program, target).await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TransportError::Timeout(ready_timeout.as_millis()));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    async fn connect(&self, config: &ValidatedConfig) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(existing) if !existing.monitor.is_finished() => return Ok(()),
            Some(_) => {
                tracing::debug!("Discarding dead SSH master before reconnecting");
                *guard = None;
            }
            None => {}
        }

        let program = resolve_executable_path(&self.ssh_program)
            .await
            .ok_or_else(|| {
                TransportError::Connect(format!("ssh executable not found: {}", self.ssh_program))
            })?;

        let (identity_file, key_file, password) = match &config.credentials {
            Credentials::KeyContent(key) => {
                let file = write_key_file(key)?;
                (Some(file.path().to_path_buf()), Some(file), None)
            }
            Credentials::KeyFile(path) => (Some(path.clone()), None, None),
            Credentials::Password(password) => (None, None, Some(password.clone())),
        };

        let target = SshTarget {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            control_path: control_path(),
            identity_file,
            password_auth: password.is_some(),
        };

        let mut cmd = if let Some(password) = &password {
            let sshpass = resolve_executable_path("sshpass").await.ok_or_else(|| {
                TransportError::Connect(
                    "password authentication requires `sshpass` on PATH".to_string(),
                )
            })?;
            let mut cmd = Command::new(sshpass);
            cmd.arg("-e").arg(&program).env("SSHPASS", password);
            cmd
        } else {
            Command::new(&program)
        };
        cmd.args(target.master_args(config.connect_timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(host = %target.host, port = target.port, user = %target.username, "Starting SSH master connection");

        let mut child = cmd
            .group_spawn()
            .map_err(|e| TransportError::Connect(format!("failed to spawn ssh: {e}")))?;
        let tail = spawn_stderr_tail(&mut child);

        if let Err(e) =
            wait_until_ready(&program, &target, &mut child, &tail, config.ready_timeout).await
        {
            if let Err(kill_err) = child.kill().await {
                tracing::debug!("Failed to kill ssh master: {kill_err}");
            }
            let _ = tokio::fs::remove_file(&target.control_path).await;
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let events = self.events.clone();
        let control = target.control_path.clone();
        let monitor = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx.fuse();
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) if status.success() => {
                            let _ = events.send(TransportEvent::End);
                        }
                        Ok(status) => {
                            let stderr = read_tail(&tail);
                            tracing::warn!(%status, %stderr, "SSH master connection exited");
                            let _ = events.send(TransportEvent::Error(format!("ssh master exited with {status}: {stderr}")));
                        }
                        Err(e) => {
                            let _ = events.send(TransportEvent::Error(e.to_string()));
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!("Failed to kill ssh master: {e}");
                    }
                }
            }
            let _ = tokio::fs::remove_file(&control).await;
            let _ = events.send(TransportEvent::Closed);
        });

        tracing::info!(host = %target.host, "SSH master connection ready");
        let _ = self.events.send(TransportEvent::Ready);

        *guard = Some(Connection {
            program,
            target,
            shutdown_tx: Some(shutdown_tx),
            monitor,
            _key_file: key_file,
        });
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ProcessChannel, TransportError> {
        let (program, target) = self.channel_target().await?;
        let args = target
            .exec_args(command)
            .map_err(|e| TransportError::Exec(e.to_string()))?;

        tracing::debug!(%command, "Opening SSH channel");

        let mut child = Command::new(&program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Exec(format!("failed to spawn ssh: {e}")))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(TransportError::Exec("ssh channel pipes unavailable".to_string()));
        };

        let closed = async move { child.wait().await.ok().and_then(|s| s.code()) }.boxed();

        Ok(ProcessChannel {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            closed,
        })
    }

    async fn write_file(&self, remote_path: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let path = quote(remote_path).map_err(|e| TransportError::Transfer(e.to_string()))?;
        let command = match Path::new(remote_path).parent().map(|p| p.to_string_lossy()) {
            Some(dir) if !dir.is_empty() => {
                let dir = quote(&dir).map_err(|e| TransportError::Transfer(e.to_string()))?;
                format!("mkdir -p {dir} && cat > {path}")
            }
            _ => format!("cat > {path}"),
        };
        self.run_remote(&command, bytes).await.map(|_| ())
    }

    async fn read_file(&self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        let path = quote(remote_path).map_err(|e| TransportError::Transfer(e.to_string()))?;
        self.run_remote(&format!("cat {path}"), &[]).await
    }

    async fn disconnect(&self) {
        let Some(mut connection) = self.connection.lock().await.take() else {
            return;
        };

        let exited = Command::new(&connection.program)
            .args(connection.target.exit_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success());
        if !exited {
            if let Some(tx) = connection.shutdown_tx.take() {
                let _ = tx.send(());
            }
        }

        if let Err(e) = connection.monitor.await {
            tracing::debug!("SSH monitor task ended abnormally: {e}");
        }
        tracing::info!(host = %connection.target.host, "SSH connection closed");
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
