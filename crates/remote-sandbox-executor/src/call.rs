//! Call encoding and transport.

use std::sync::Arc;

use remote_sandbox_core::{
    LogDemux, LogEvent, LogSink, RemoteError, RemoteResult, ResultEnvelope, Transport, decode,
};

/// Everything one call produced, after demultiplexing.
#[derive(Debug, Clone)]
pub struct RawCall {
    pub stdout: Vec<u8>,
    /// Diagnostic text left after log lines were removed.
    pub residual: String,
    pub events: Vec<LogEvent>,
    pub exit_code: Option<i32>,
}

impl RawCall {
    /// Decode the result envelope.
    #[must_use]
    pub fn decode(&self) -> ResultEnvelope {
        decode(&self.stdout, &self.residual)
    }
}

/// Shell command starting the runner at `runner_path`.
#[must_use]
pub fn runner_command(node_binary: &str, runner_path: &str) -> String {
    let path = shlex::try_quote(runner_path).map_or_else(|_| runner_path.to_string(), |q| q.into_owned());
    format!("{node_binary} {path}")
}

/// Run one call: open a channel running `command`, write `payload`, close
/// the input stream and collect both streams until the channel closes.
///
/// Log lines are forwarded to `sink` as they arrive.
///
/// # Errors
/// Returns `ExecutionError` if the channel cannot be opened or its streams
/// cannot be read. No envelope parsing happens in that case.
pub async fn invoke(
    transport: &dyn Transport,
    command: &str,
    payload: &[u8],
    sink: Option<Arc<dyn LogSink>>,
) -> RemoteResult<RawCall> {
    let channel = transport
        .exec(command)
        .await
        .map_err(|e| RemoteError::execution(format!("Failed to start runner: {e}")))?;

    let mut demux = LogDemux::new(sink);
    let output = channel
        .run_with(payload, |chunk| demux.feed(chunk))
        .await
        .map_err(|e| RemoteError::execution(format!("Runner channel failed: {e}")))?;
    let (events, residual) = demux.finish();

    Ok(RawCall {
        stdout: output.stdout,
        residual,
        events,
        exit_code: output.exit_code,
    })
}

#[cfg(test)]
mod tests {
    use remote_sandbox_core::{
        ErrorCode, LOG_SENTINEL, LogLevel, LogStore, SandboxConfig,
        testing::{MockReply, MockTransport},
    };
    use serde_json::json;

    use super::*;

    async fn connect(mock: &MockTransport) {
        let config = SandboxConfig {
            host: "h".into(),
            username: "u".into(),
            password: Some("p".into()),
            sandbox_path: "/srv".into(),
            ..SandboxConfig::default()
        }
        .validate()
        .unwrap();
        mock.connect(&config).await.unwrap();
    }

    #[test]
    fn test_runner_command_quotes_path() {
        assert_eq!(
            runner_command("node", "/tmp/remote-sandbox-code-1.cjs"),
            "node /tmp/remote-sandbox-code-1.cjs"
        );
        let cmd = runner_command("node", "/tmp/with space.cjs");
        assert_eq!(
            shlex::split(&cmd).unwrap(),
            vec!["node".to_string(), "/tmp/with space.cjs".to_string()]
        );
    }

    #[tokio::test]
    async fn test_payload_written_and_streams_collected() {
        let mock = MockTransport::new(|_, stdin| {
            let payload: serde_json::Value = serde_json::from_slice(stdin).unwrap();
            let log = format!("{LOG_SENTINEL}{{\"type\":\"info\",\"args\":[\"working\"]}}\n");
            MockReply::envelope(&ResultEnvelope::Success(payload["args"].clone()))
                .with_stderr(format!("{log}deprecation warning\n"))
        });
        connect(&mock).await;

        let store = Arc::new(LogStore::new());
        let payload = br#"{"sandboxPath":"/srv","streamLogs":true,"modulePath":"./m","functionName":"f","args":[1,2]}"#;
        let raw = invoke(&mock, "node /tmp/r.cjs", payload, Some(store.clone()))
            .await
            .unwrap();

        assert_eq!(raw.exit_code, Some(0));
        assert_eq!(raw.residual, "deprecation warning");
        assert_eq!(raw.events.len(), 1);
        assert_eq!(raw.events[0].level, LogLevel::Info);
        assert_eq!(store.history(), raw.events);
        assert_eq!(raw.decode(), ResultEnvelope::Success(json!([1, 2])));

        let execs = mock.execs();
        assert_eq!(execs[0].command, "node /tmp/r.cjs");
        assert_eq!(execs[0].stdin, payload.to_vec());
    }

    #[tokio::test]
    async fn test_rejected_exec_is_execution_error() {
        let mock = MockTransport::new(|_, _| MockReply::default()).rejecting_exec();
        connect(&mock).await;

        let err = invoke(&mock, "node /tmp/r.cjs", b"{}", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionError);
        assert!(err.message.contains("Failed to start runner"));
    }
}
