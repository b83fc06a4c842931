//! The call pipeline.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use remote_sandbox_core::{
    CallMode, CallRequest, LogSink, RemoteError, RemoteResult, TracingLogSink,
    Transport, ValidatedConfig,
};
use serde_json::{Value, json};

use crate::{RunnerKind, RunnerProvisioner, call::invoke, runner_command};

/// Capability interface behind module handles.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    /// Call `function_name` exported by `module_path` with `args`.
    async fn invoke_function(
        &self,
        module_path: &str,
        function_name: &str,
        args: Vec<Value>,
    ) -> RemoteResult<Value>;
}

/// Per-session settings every call carries.
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub sandbox_path: String,
    pub stream_logs: bool,
    pub node_binary: String,
}

impl From<&ValidatedConfig> for CallSettings {
    fn from(config: &ValidatedConfig) -> Self {
        Self {
            sandbox_path: config.sandbox_path.clone(),
            stream_logs: config.stream_logs,
            node_binary: config.node_binary.clone(),
        }
    }
}

/// Runs calls for one session.
pub struct CallExecutor {
    transport: Arc<dyn Transport>,
    provisioner: RunnerProvisioner,
    settings: CallSettings,
    sink: RwLock<Arc<dyn LogSink>>,
}

impl CallExecutor {
    /// Create an executor whose remote log events go to `tracing`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, settings: CallSettings) -> Self {
        Self {
            provisioner: RunnerProvisioner::new(Arc::clone(&transport)),
            transport,
            settings,
            sink: RwLock::new(Arc::new(TracingLogSink)),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &CallSettings {
        &self.settings
    }

    #[must_use]
    pub const fn provisioner(&self) -> &RunnerProvisioner {
        &self.provisioner
    }

    /// Replace the observer for remote log events.
    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        if let Ok(mut current) = self.sink.write() {
            *current = sink;
        }
    }

    fn log_sink(&self) -> Arc<dyn LogSink> {
        self.sink
            .read()
            .map_or_else(|_| Arc::new(TracingLogSink) as Arc<dyn LogSink>, |s| Arc::clone(&s))
    }

    /// Evaluate `code` in the sandbox.
    ///
    /// # Errors
    /// Returns `ExecutionError` if the code throws, times out, or the
    /// runner cannot be started.
    pub async fn run_code(&self, code: &str) -> RemoteResult<Value> {
        self.execute(CallRequest::code(
            &self.settings.sandbox_path,
            code,
            self.settings.stream_logs,
        ))
        .await
    }

    /// Call an exported function of a sandbox module.
    ///
    /// # Errors
    /// Returns `ExecutionError` if the module or function is missing, the
    /// function throws or rejects, or the runner cannot be started.
    pub async fn call_function(
        &self,
        module_path: &str,
        function_name: &str,
        args: Vec<Value>,
    ) -> RemoteResult<Value> {
        self.execute(CallRequest::function(
            &self.settings.sandbox_path,
            module_path,
            function_name,
            args,
            self.settings.stream_logs,
        ))
        .await
    }

    /// Run a prepared request through the whole pipeline.
    ///
    /// # Errors
    /// See [`run_code`](Self::run_code) and [`call_function`](Self::call_function).
    pub async fn execute(&self, request: CallRequest) -> RemoteResult<Value> {
        let kind = match request.mode {
            CallMode::Code { .. } => RunnerKind::Code,
            CallMode::Function { .. } => RunnerKind::Function,
        };

        let payload = request.to_payload().map_err(|e| {
            RemoteError::execution(format!("Failed to encode call arguments: {e}"))
        })?;
        let runner = self.provisioner.ensure_runner(kind).await?;
        let command = runner_command(&self.settings.node_binary, &runner);

        match &request.mode {
            CallMode::Function {
                module_path,
                function_name,
                ..
            } => tracing::debug!(module = %module_path, function = %function_name, "Calling remote function"),
            CallMode::Code { code } => tracing::debug!(bytes = code.len(), "Running remote code"),
        }

        let raw = invoke(
            self.transport.as_ref(),
            &command,
            &payload,
            Some(self.log_sink()),
        )
        .await?;

        let envelope = raw.decode();
        if !envelope.is_success() {
            tracing::debug!(exit_code = ?raw.exit_code, mode = request.mode.label(), "Remote call failed");
        } else if raw.exit_code.is_some_and(|c| c != 0) {
            tracing::warn!(exit_code = ?raw.exit_code, "Runner exited non-zero after a successful result");
        }

        envelope.into_result().map_err(|err| match (err.details.is_some(), raw.exit_code) {
            (false, Some(code)) => err.with_details(json!({ "exitCode": code })),
            _ => err,
        })
    }
}

#[async_trait]
impl FunctionInvoker for CallExecutor {
    async fn invoke_function(
        &self,
        module_path: &str,
        function_name: &str,
        args: Vec<Value>,
    ) -> RemoteResult<Value> {
        self.call_function(module_path, function_name, args).await
    }
}

#[cfg(test)]
mod tests {
    use remote_sandbox_core::{
        ErrorCode, LOG_SENTINEL, LogStore, RemoteFailure, ResultEnvelope, SandboxConfig,
        testing::{MockReply, MockTransport},
    };

    use super::*;

    /// Stand-in for the runner programs.
    fn fake_runner(command: &str, stdin: &[u8]) -> MockReply {
        if !command.starts_with("node ") {
            return MockReply::stdout("");
        }
        let Ok(request) = serde_json::from_slice::<CallRequest>(stdin) else {
            return MockReply::failed("SyntaxError: Unexpected end of JSON input", 1);
        };
        match request.mode {
            CallMode::Code { code } if code == "1 + 1" => {
                MockReply::envelope(&ResultEnvelope::Success(json!(2)))
            }
            CallMode::Code { .. } => MockReply::failed("", 1),
            CallMode::Function {
                function_name,
                args,
                ..
            } => match function_name.as_str() {
                "add" => {
                    let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                    MockReply::envelope(&ResultEnvelope::Success(json!(sum)))
                }
                "echo" => MockReply::envelope(&ResultEnvelope::Success(json!(args))),
                "chatty" => MockReply::envelope(&ResultEnvelope::Success(Value::Null)).with_stderr(
                    format!("{LOG_SENTINEL}{{\"type\":\"log\",\"args\":[\"hi\"]}}\n"),
                ),
                "reject" => {
                    let mut reply = MockReply::envelope(&ResultEnvelope::Failure(RemoteFailure {
                        message: "bad input".into(),
                        name: Some("Error".into()),
                        stack: Some("Error: bad input\n    at reject".into()),
                    }));
                    reply.exit_code = Some(1);
                    reply
                }
                "crash" => MockReply::failed("Segmentation fault", 139),
                other => {
                    let mut reply = MockReply::envelope(&ResultEnvelope::Failure(RemoteFailure {
                        message: format!("Function '{other}' not found in module './m'"),
                        ..RemoteFailure::default()
                    }));
                    reply.exit_code = Some(1);
                    reply
                }
            },
        }
    }

    async fn executor(stream_logs: bool) -> (Arc<MockTransport>, CallExecutor) {
        let config = SandboxConfig {
            host: "h".into(),
            username: "u".into(),
            password: Some("p".into()),
            sandbox_path: "/srv/app".into(),
            stream_logs: Some(stream_logs),
            ..SandboxConfig::default()
        }
        .validate()
        .unwrap();
        let mock = Arc::new(MockTransport::new(fake_runner));
        mock.connect(&config).await.unwrap();
        let executor = CallExecutor::new(mock.clone(), CallSettings::from(&config));
        (mock, executor)
    }

    #[tokio::test]
    async fn test_function_call_end_to_end() {
        let (mock, executor) = executor(false).await;

        let value = executor
            .call_function("./m", "add", vec![json!(2), json!(3)])
            .await
            .unwrap();
        assert_eq!(value, json!(5));

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            CallRequest::function("/srv/app", "./m", "add", vec![json!(2), json!(3)], false)
        );
    }

    #[tokio::test]
    async fn test_arguments_round_trip() {
        let (_mock, executor) = executor(false).await;
        let args = vec![json!("a"), json!(2), json!({ "k": 1 })];
        let value = executor.call_function("./m", "echo", args.clone()).await.unwrap();
        assert_eq!(value, json!(args));
    }

    #[tokio::test]
    async fn test_rejection_is_execution_error() {
        let (_mock, executor) = executor(false).await;
        let err = executor
            .call_function("./m", "reject", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionError);
        assert_eq!(err.message, "bad input");
        assert_eq!(err.details.unwrap()["name"], "Error");
    }

    #[tokio::test]
    async fn test_missing_function_is_execution_error() {
        let (_mock, executor) = executor(false).await;
        let err = executor
            .call_function("./m", "nope", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionError);
        assert!(err.message.contains("not found"));
        assert_eq!(err.details.unwrap()["exitCode"], 1);
    }

    #[tokio::test]
    async fn test_diagnostic_text_becomes_error() {
        let (_mock, executor) = executor(false).await;
        let err = executor
            .call_function("./m", "crash", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.message, "Segmentation fault");
    }

    #[tokio::test]
    async fn test_runners_uploaded_once_per_kind() {
        let (mock, executor) = executor(false).await;
        executor.run_code("1 + 1").await.unwrap();
        executor.run_code("1 + 1").await.unwrap();
        executor.call_function("./m", "add", vec![]).await.unwrap();

        assert_eq!(mock.write_count(), 2);
        let code_runner = executor.provisioner().cached(RunnerKind::Code).unwrap();
        assert_eq!(mock.execs()[0].command, format!("node {code_runner}"));
    }

    #[tokio::test]
    async fn test_logs_forwarded_to_sink() {
        let (mock, executor) = executor(true).await;
        let store = Arc::new(LogStore::new());
        executor.set_log_sink(store.clone());

        let value = executor.call_function("./m", "chatty", vec![]).await.unwrap();
        assert_eq!(value, Value::Null);
        assert_eq!(store.history().len(), 1);
        assert_eq!(store.history()[0].message(), "hi");
        assert!(mock.calls()[0].stream_logs);
    }

    #[tokio::test]
    async fn test_invoker_interface() {
        let (_mock, executor) = executor(false).await;
        let invoker: Arc<dyn FunctionInvoker> = Arc::new(executor);
        let value = invoker
            .invoke_function("./m", "add", vec![json!(40), json!(2)])
            .await
            .unwrap();
        assert_eq!(value, json!(42));
    }
}
