//! Wire protocol between the caller and the runner programs.
//!
//! Three formats travel over a process channel:
//! - the call payload, one JSON document on the input stream
//! - the result envelope, a trailing JSON object on the output stream
//! - log lines, sentinel-prefixed JSON objects on the diagnostic stream

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::RemoteError;

/// What a call asks the runner to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallMode {
    /// Evaluate code inside an isolated context.
    Code { code: String },
    /// Call an exported function of a module in the sandbox.
    Function {
        #[serde(rename = "modulePath")]
        module_path: String,
        #[serde(rename = "functionName")]
        function_name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl CallMode {
    /// Short name used for logging.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Code { .. } => "code",
            Self::Function { .. } => "function",
        }
    }
}

/// A single call, serialized as the runner's stdin payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub sandbox_path: String,
    pub stream_logs: bool,
    #[serde(flatten)]
    pub mode: CallMode,
}

impl CallRequest {
    /// Build a code-mode request.
    pub fn code(sandbox_path: impl Into<String>, code: impl Into<String>, stream_logs: bool) -> Self {
        Self {
            sandbox_path: sandbox_path.into(),
            stream_logs,
            mode: CallMode::Code { code: code.into() },
        }
    }

    /// Build a function-mode request.
    pub fn function(
        sandbox_path: impl Into<String>,
        module_path: impl Into<String>,
        function_name: impl Into<String>,
        args: Vec<Value>,
        stream_logs: bool,
    ) -> Self {
        Self {
            sandbox_path: sandbox_path.into(),
            stream_logs,
            mode: CallMode::Function {
                module_path: module_path.into(),
                function_name: function_name.into(),
                args,
            },
        }
    }

    /// Encode as the single JSON document written to the input stream.
    ///
    /// # Errors
    /// Returns error if an argument cannot be serialized.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Error details reported by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Decoded outcome of one call.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultEnvelope {
    Success(Value),
    Failure(RemoteFailure),
}

impl ResultEnvelope {
    /// Interpret a parsed JSON object as an envelope.
    ///
    /// Returns `None` when the value has no `success` key.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let success = obj.get("success")?;

        if truthy(success) {
            return Some(Self::Success(obj.get("result").cloned().unwrap_or(Value::Null)));
        }

        let failure = match obj.get("error") {
            Some(Value::String(message)) => RemoteFailure {
                message: message.clone(),
                ..RemoteFailure::default()
            },
            Some(err @ Value::Object(_)) => {
                serde_json::from_value::<RemoteFailure>(err.clone()).unwrap_or_else(|_| {
                    RemoteFailure {
                        message: err.to_string(),
                        ..RemoteFailure::default()
                    }
                })
            }
            _ => RemoteFailure {
                message: "Unknown remote error".to_string(),
                ..RemoteFailure::default()
            },
        };
        Some(Self::Failure(failure))
    }

    /// Wire form as emitted by the runner programs.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Success(result) => json!({ "success": true, "result": result }),
            Self::Failure(err) => json!({ "success": false, "error": err }),
        }
    }

    /// Convert into the public result type.
    ///
    /// # Errors
    /// A `Failure` becomes an `ExecutionError` carrying the remote name and stack.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(RemoteFailure { message, name, stack }) => {
                let err = RemoteError::execution(message);
                if name.is_none() && stack.is_none() {
                    Err(err)
                } else {
                    Err(err.with_details(json!({ "name": name, "stack": stack })))
                }
            }
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Log level of a forwarded console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Error,
    Warn,
    Info,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One console call made by remote code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub level: LogLevel,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl LogEvent {
    /// Render the arguments the way a console would: strings verbatim,
    /// everything else as JSON, joined by spaces.
    #[must_use]
    pub fn message(&self) -> String {
        self.args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
