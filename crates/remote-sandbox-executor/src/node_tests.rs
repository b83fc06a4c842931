//! The embedded runner programs executed by a local `node`.
//!
//! Every test returns early when no `node` binary is on the path.

use std::{path::Path, process::Stdio, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use remote_sandbox_core::{
    ErrorCode, LogLevel, LogStore, ProcessChannel, Transport, TransportError, TransportEvent,
    ValidatedConfig,
};
use serde_json::{Value, json};
use tokio::{process::Command, sync::broadcast};

use crate::{CallExecutor, CallSettings};

/// Runs commands on this machine through `sh -c`.
struct LocalTransport {
    timeout_ms: Option<u64>,
    events: broadcast::Sender<TransportEvent>,
}

impl LocalTransport {
    fn new(timeout_ms: Option<u64>) -> Self {
        Self {
            timeout_ms,
            events: broadcast::channel(4).0,
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, _config: &ValidatedConfig) -> Result<(), TransportError> {
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<ProcessChannel, TransportError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ms) = self.timeout_ms {
            cmd.env("REMOTE_SANDBOX_TIMEOUT_MS", ms.to_string());
        }

        let mut child = cmd.spawn()?;
        let missing = || TransportError::Exec("missing pipe".into());
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        Ok(ProcessChannel {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            closed: async move { child.wait().await.ok().and_then(|s| s.code()) }.boxed(),
        })
    }

    async fn write_file(&self, remote_path: &str, bytes: &[u8]) -> Result<(), TransportError> {
        if let Some(parent) = Path::new(remote_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(remote_path, bytes).await?;
        Ok(())
    }

    async fn read_file(&self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        Ok(tokio::fs::read(remote_path).await?)
    }

    async fn disconnect(&self) {}

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

async fn node_available() -> bool {
    let found = Command::new("node")
        .arg("--version")
        .output()
        .await
        .is_ok_and(|out| out.status.success());
    if !found {
        eprintln!("node not found, skipping");
    }
    found
}

/// A sandbox directory holding a few modules.
fn sandbox() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("math.js"),
        r"
exports.add = (a, b) => a + b;
exports.limit = 42;
exports.reject = async (message) => { throw new Error(message); };
exports.chatty = () => {
  console.log('hello', 1);
  console.warn('careful');
  return 'done';
};
",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("greeter.mjs"),
        "export default { greet(name) { return `hi ${name}`; } };\n",
    )
    .unwrap();
    dir
}

fn executor(dir: &tempfile::TempDir, stream_logs: bool, timeout_ms: Option<u64>) -> CallExecutor {
    CallExecutor::new(
        Arc::new(LocalTransport::new(timeout_ms)),
        CallSettings {
            sandbox_path: dir.path().to_string_lossy().into_owned(),
            stream_logs,
            node_binary: "node".into(),
        },
    )
}

#[tokio::test]
async fn test_code_yields_completion_value() {
    if !node_available().await {
        return;
    }
    let dir = sandbox();
    let exec = executor(&dir, false, None);

    assert_eq!(exec.run_code("1 + 1;").await.unwrap(), json!(2));
    assert_eq!(exec.run_code("const x = 5; x * 2").await.unwrap(), json!(10));
    assert_eq!(
        exec.run_code("let items = [1, 2, 3];\nitems.map((n) => n * 2);").await.unwrap(),
        json!([2, 4, 6])
    );
    assert_eq!(exec.run_code("undefined").await.unwrap(), Value::Null);

    exec.provisioner().cleanup().await;
}

#[tokio::test]
async fn test_code_top_level_await() {
    if !node_available().await {
        return;
    }
    let dir = sandbox();
    let exec = executor(&dir, false, None);

    assert_eq!(exec.run_code("await Promise.resolve(7)").await.unwrap(), json!(7));
    assert_eq!(exec.run_code("Promise.resolve('later')").await.unwrap(), json!("later"));

    let err = exec.run_code("await Promise.reject(new TypeError('nope'))").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ExecutionError);
    assert_eq!(err.message, "nope");

    exec.provisioner().cleanup().await;
}

#[tokio::test]
async fn test_code_sees_sandbox_modules() {
    if !node_available().await {
        return;
    }
    let dir = sandbox();
    let exec = executor(&dir, false, None);

    let value = exec.run_code("require('./math').add(2, 3)").await.unwrap();
    assert_eq!(value, json!(5));

    exec.provisioner().cleanup().await;
}

#[tokio::test]
async fn test_code_timeout() {
    if !node_available().await {
        return;
    }
    let dir = sandbox();
    let exec = executor(&dir, false, Some(200));

    let err = exec.run_code("new Promise(() => {})").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ExecutionError);
    assert!(err.message.contains("timed out"), "{}", err.message);

    let err = exec.run_code("while (true) {}").await.unwrap_err();
    assert!(err.message.contains("timed out"), "{}", err.message);

    exec.provisioner().cleanup().await;
}

#[tokio::test]
async fn test_function_calls() {
    if !node_available().await {
        return;
    }
    let dir = sandbox();
    let exec = executor(&dir, false, None);

    let sum = exec.call_function("./math", "add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(sum, json!(5));

    let greeting = exec
        .call_function("./greeter.mjs", "greet", vec![json!("Ada")])
        .await
        .unwrap();
    assert_eq!(greeting, json!("hi Ada"));

    exec.provisioner().cleanup().await;
}

#[tokio::test]
async fn test_function_lookup_failures() {
    if !node_available().await {
        return;
    }
    let dir = sandbox();
    let exec = executor(&dir, false, None);

    let err = exec.call_function("./missing", "add", vec![]).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ExecutionError);
    assert_eq!(err.message, "Module not found: ./missing");

    let err = exec.call_function("./math", "limit", vec![]).await.unwrap_err();
    assert_eq!(err.message, "'limit' in module './math' is not a function");

    let err = exec.call_function("./math", "subtract", vec![]).await.unwrap_err();
    assert_eq!(err.message, "Function 'subtract' not found in module './math'");

    exec.provisioner().cleanup().await;
}

#[tokio::test]
async fn test_function_rejection_keeps_details() {
    if !node_available().await {
        return;
    }
    let dir = sandbox();
    let exec = executor(&dir, false, None);

    let err = exec
        .call_function("./math", "reject", vec![json!("bad input")])
        .await
        .unwrap_err();
    assert_eq!(err.message, "bad input");
    let details = err.details.unwrap();
    assert_eq!(details["name"], "Error");
    assert!(details["stack"].as_str().unwrap().contains("bad input"));

    exec.provisioner().cleanup().await;
}

#[tokio::test]
async fn test_streamed_console_lines() {
    if !node_available().await {
        return;
    }
    let dir = sandbox();
    let exec = executor(&dir, true, None);
    let store = Arc::new(LogStore::new());
    exec.set_log_sink(store.clone());

    let value = exec.call_function("./math", "chatty", vec![]).await.unwrap();
    assert_eq!(value, json!("done"));

    let history = store.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].level, LogLevel::Log);
    assert_eq!(history[0].message(), "hello 1");
    assert_eq!(history[1].level, LogLevel::Warn);

    exec.run_code("console.error('from code')").await.unwrap();
    assert_eq!(store.history().last().unwrap().message(), "from code");

    exec.provisioner().cleanup().await;
}
