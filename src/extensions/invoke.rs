//! Invocation results.
//!
//! Errors thrown inside a sandbox never cross the boundary as errors: a call
//! settles as a value, a captured exception, or "no such function". The host
//! turns that into an [`InvocationOutcome`] whose JSON form is what UI and
//! IPC callers receive.

use serde_json::{json, Value};

use super::error::{ExtensionError, ExtensionResult};
use super::ipc::SettledCall;

/// How a call settled inside the execution context.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    Returned(Value),
    Threw {
        message: String,
        stack: Option<String>,
    },
    /// The module does not export the function.
    Missing,
}

impl From<SettledCall> for CallResult {
    fn from(settled: SettledCall) -> Self {
        if settled.not_found {
            Self::Missing
        } else if settled.ok {
            Self::Returned(settled.value.unwrap_or(Value::Null))
        } else {
            Self::Threw {
                message: settled
                    .message
                    .unwrap_or_else(|| "Unknown error".to_string()),
                stack: settled.stack,
            }
        }
    }
}

/// Result of `invoke`, as handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Success(Value),
    /// Optional capability absent; not a failure of the extension.
    NotFound { function: String },
    Failed {
        error: String,
        stack: Option<String>,
    },
}

impl InvocationOutcome {
    pub fn from_call(function: &str, result: CallResult) -> Self {
        match result {
            CallResult::Returned(value) => Self::Success(value),
            CallResult::Missing => Self::NotFound {
                function: function.to_string(),
            },
            CallResult::Threw { message, stack } => Self::Failed {
                error: message,
                stack,
            },
        }
    }

    /// Map a host-side failure (creation, timeout, teardown) into an outcome.
    pub fn from_error(err: &ExtensionError) -> Self {
        match err {
            ExtensionError::FunctionNotFound { function, .. } => Self::NotFound {
                function: function.clone(),
            },
            ExtensionError::InvocationFailed { message, stack, .. } => Self::Failed {
                error: message.clone(),
                stack: stack.clone(),
            },
            other => Self::Failed {
                error: other.to_string(),
                stack: None,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    /// `{success, data}` or `{success:false, error, stack | notFound}`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Success(data) => json!({ "success": true, "data": data }),
            Self::NotFound { function } => json!({
                "success": false,
                "error": format!("Function '{}' not found", function),
                "notFound": true,
            }),
            Self::Failed { error, stack } => json!({
                "success": false,
                "error": error,
                "stack": stack,
            }),
        }
    }

    /// Convert into a `Result`, attributing failures to an extension.
    pub fn into_result(self, extension_id: &str, function: &str) -> ExtensionResult<Value> {
        match self {
            Self::Success(value) => Ok(value),
            Self::NotFound { function } => Err(ExtensionError::FunctionNotFound {
                extension: extension_id.to_string(),
                function,
            }),
            Self::Failed { error, stack } => Err(ExtensionError::InvocationFailed {
                extension: extension_id.to_string(),
                function: function.to_string(),
                message: error,
                stack,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct_from_failure() {
        let missing = InvocationOutcome::from_call("getFilters", CallResult::Missing);
        let thrown = InvocationOutcome::from_call(
            "getFilters",
            CallResult::Threw {
                message: "boom".to_string(),
                stack: Some("at getFilters (index.js:3)".to_string()),
            },
        );

        assert!(missing.is_not_found());
        assert!(!thrown.is_not_found());

        let missing = missing.to_json();
        assert_eq!(missing["success"], json!(false));
        assert_eq!(missing["notFound"], json!(true));

        let thrown = thrown.to_json();
        assert_eq!(thrown["success"], json!(false));
        assert_eq!(thrown["error"], json!("boom"));
        assert_eq!(thrown["stack"], json!("at getFilters (index.js:3)"));
        assert!(thrown.get("notFound").is_none());
    }

    #[test]
    fn test_settled_call_conversion() {
        let ok = SettledCall {
            ok: true,
            value: Some(json!([1, 2])),
            ..Default::default()
        };
        assert_eq!(CallResult::from(ok), CallResult::Returned(json!([1, 2])));

        let undefined = SettledCall {
            ok: true,
            ..Default::default()
        };
        assert_eq!(CallResult::from(undefined), CallResult::Returned(Value::Null));

        let missing = SettledCall {
            not_found: true,
            ..Default::default()
        };
        assert_eq!(CallResult::from(missing), CallResult::Missing);

        let thrown = SettledCall {
            message: Some("bad".into()),
            ..Default::default()
        };
        assert!(matches!(CallResult::from(thrown), CallResult::Threw { message, .. } if message == "bad"));
    }

    #[test]
    fn test_into_result() {
        let outcome = InvocationOutcome::Success(json!("x"));
        assert_eq!(outcome.into_result("demo", "fn").unwrap(), json!("x"));

        let err = InvocationOutcome::NotFound {
            function: "fn".into(),
        }
        .into_result("demo", "fn")
        .unwrap_err();
        assert!(matches!(err, ExtensionError::FunctionNotFound { .. }));
    }

    #[test]
    fn test_host_errors_become_failures() {
        let outcome = InvocationOutcome::from_error(&ExtensionError::LoadFailed {
            extension: "demo".into(),
            message: "SyntaxError".into(),
        });
        assert!(matches!(outcome, InvocationOutcome::Failed { ref error, .. } if error.contains("SyntaxError")));
    }
}
