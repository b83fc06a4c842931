//! Transparent module proxies.
//!
//! A [`ModuleHandle`] stands for a module in the remote sandbox. Its shape
//! is unknown locally: every name except a few reserved ones resolves to a
//! [`RemoteFunction`], and calling it performs one function-mode call.

use std::{fmt, sync::Arc};

use remote_sandbox_core::{RemoteError, RemoteResult};
use remote_sandbox_executor::FunctionInvoker;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Names that never resolve to remote functions, so a handle is not
/// mistaken for an awaitable value.
pub const RESERVED_NAMES: &[&str] = &["then", "catch", "finally"];

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Turn serializable call arguments into a positional argument list.
///
/// Tuples and sequences spread into positions, `()` means no arguments,
/// and any other value is passed as the single argument.
fn to_args<A: Serialize>(args: A) -> RemoteResult<Vec<Value>> {
    let value = serde_json::to_value(args)
        .map_err(|e| RemoteError::execution(format!("Failed to encode call arguments: {e}")))?;
    Ok(match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

fn decode_as<R: DeserializeOwned>(value: Value) -> RemoteResult<R> {
    serde_json::from_value(value.clone()).map_err(|e| {
        RemoteError::parse(format!("Unexpected result shape: {e}")).with_details(value)
    })
}

/// A remote module.
pub struct ModuleHandle {
    module_path: String,
    invoker: Arc<dyn FunctionInvoker>,
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("module_path", &self.module_path)
            .finish_non_exhaustive()
    }
}

impl ModuleHandle {
    /// Create a handle dispatching through `invoker`.
    pub fn new(module_path: impl Into<String>, invoker: Arc<dyn FunctionInvoker>) -> Self {
        Self {
            module_path: module_path.into(),
            invoker,
        }
    }

    /// Module path, relative to the sandbox.
    #[must_use]
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    /// Resolve `name` to a callable. `None` only for reserved names.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<RemoteFunction> {
        if is_reserved(name) {
            return None;
        }
        Some(RemoteFunction {
            module_path: self.module_path.clone(),
            name: name.to_string(),
            invoker: Arc::clone(&self.invoker),
        })
    }

    /// Whether `name` resolves. The remote shape is unknown, so every
    /// non-reserved name does.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        !is_reserved(name)
    }

    /// Own keys. Always empty: the remote module is not introspected.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// Call `name` with positional JSON arguments.
    ///
    /// # Errors
    /// Returns `ExecutionError` for reserved names and for any remote failure.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> RemoteResult<Value> {
        let function = self.function(name).ok_or_else(|| {
            RemoteError::execution(format!(
                "'{name}' is reserved and is not a function of module '{}'",
                self.module_path
            ))
        })?;
        function.call(args).await
    }

    /// Call `name` with any serializable arguments (a tuple spreads into
    /// positions).
    ///
    /// # Errors
    /// See [`call`](Self::call).
    pub async fn call_with<A: Serialize>(&self, name: &str, args: A) -> RemoteResult<Value> {
        self.call(name, to_args(args)?).await
    }

    /// Call `name` and decode the result into `R`.
    ///
    /// # Errors
    /// Returns `ParseError` if the result does not match `R`.
    pub async fn call_as<R: DeserializeOwned>(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> RemoteResult<R> {
        decode_as(self.call(name, args).await?)
    }
}

/// A function of a remote module, resolved by name.
#[derive(Clone)]
pub struct RemoteFunction {
    module_path: String,
    name: String,
    invoker: Arc<dyn FunctionInvoker>,
}

impl fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFunction")
            .field("module_path", &self.module_path)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RemoteFunction {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Perform one function-mode call.
    ///
    /// # Errors
    /// Returns the decoded remote error.
    pub async fn call(&self, args: Vec<Value>) -> RemoteResult<Value> {
        tracing::trace!(module = %self.module_path, function = %self.name, "Proxy dispatch");
        self.invoker
            .invoke_function(&self.module_path, &self.name, args)
            .await
    }

    /// Call with serializable arguments.
    ///
    /// # Errors
    /// See [`call`](Self::call).
    pub async fn call_with<A: Serialize>(&self, args: A) -> RemoteResult<Value> {
        self.call(to_args(args)?).await
    }

    /// Call and decode the result into `R`.
    ///
    /// # Errors
    /// Returns `ParseError` if the result does not match `R`.
    pub async fn call_as<R: DeserializeOwned>(&self, args: Vec<Value>) -> RemoteResult<R> {
        decode_as(self.call(args).await?)
    }
}

/// Call a remote function the way it reads locally.
///
/// `remote_call!(math.add(2, 3))` expands to
/// `math.call_with("add", (2, 3))`.
#[macro_export]
macro_rules! remote_call {
    ($handle:ident . $name:ident ( $($arg:expr),* $(,)? )) => {
        $handle.call_with(stringify!($name), ($($arg,)*))
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use remote_sandbox_core::ErrorCode;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, String, Vec<Value>)>>);

    #[async_trait]
    impl FunctionInvoker for Recorder {
        async fn invoke_function(
            &self,
            module_path: &str,
            function_name: &str,
            args: Vec<Value>,
        ) -> RemoteResult<Value> {
            self.0.lock().unwrap().push((
                module_path.to_string(),
                function_name.to_string(),
                args.clone(),
            ));
            if function_name == "fail" {
                return Err(RemoteError::execution("bad input"));
            }
            Ok(json!({ "called": function_name, "args": args }))
        }
    }

    fn handle() -> (Arc<Recorder>, ModuleHandle) {
        let recorder = Arc::new(Recorder::default());
        let handle = ModuleHandle::new("./m", recorder.clone());
        (recorder, handle)
    }

    #[tokio::test]
    async fn test_dispatch_issues_one_call() {
        let (recorder, handle) = handle();
        handle.call("foo", vec![json!(1), json!(2)]).await.unwrap();

        let calls = recorder.0.lock().unwrap();
        assert_eq!(
            *calls,
            vec![("./m".to_string(), "foo".to_string(), vec![json!(1), json!(2)])]
        );
    }

    #[tokio::test]
    async fn test_macro_spreads_arguments() {
        let (recorder, math) = handle();
        let out = remote_call!(math.foo(1, "two", [3])).await.unwrap();
        assert_eq!(out["called"], "foo");
        remote_call!(math.bar()).await.unwrap();

        let calls = recorder.0.lock().unwrap();
        assert_eq!(calls[0].2, vec![json!(1), json!("two"), json!([3])]);
        assert_eq!(calls[1].1, "bar");
        assert!(calls[1].2.is_empty());
    }

    #[tokio::test]
    async fn test_reserved_names() {
        let (recorder, handle) = handle();
        for name in RESERVED_NAMES {
            assert!(handle.function(name).is_none());
            assert!(!handle.has(name));
        }
        let err = handle.call("then", vec![]).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutionError);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_every_other_name_exists() {
        let (_, handle) = handle();
        assert!(handle.has("anything"));
        assert!(handle.has("constructor"));
        assert!(handle.keys().is_empty());
        assert_eq!(handle.function("add").unwrap().name(), "add");
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let (_, handle) = handle();
        let err = handle.function("fail").unwrap().call(vec![]).await.unwrap_err();
        assert_eq!(err.message, "bad input");
    }

    #[tokio::test]
    async fn test_typed_results() {
        #[derive(serde::Deserialize)]
        struct Echo {
            called: String,
            args: Vec<i64>,
        }

        let (_, handle) = handle();
        let echo: Echo = handle.call_as("sum", vec![json!(4), json!(5)]).await.unwrap();
        assert_eq!(echo.called, "sum");
        assert_eq!(echo.args, vec![4, 5]);

        let err = handle
            .call_as::<Vec<String>>("sum", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseError);
    }

    #[tokio::test]
    async fn test_single_value_argument() {
        let (recorder, handle) = handle();
        let f = handle.function("one").unwrap();
        f.call_with(json!({ "k": 1 })).await.unwrap();
        assert_eq!(recorder.0.lock().unwrap()[0].2, vec![json!({ "k": 1 })]);
    }
}
