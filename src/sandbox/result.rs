use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::{CapabilityError, CapabilityErrorKind};

/// Which stage of an execution went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingIdentity,
    CompileFailed,
    ScriptRuntimeError,
    CapabilityFailed,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Set for `CapabilityFailed`: the capability that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Set for `CapabilityFailed`: why it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CapabilityErrorKind>,
}

/// The single outcome of one execution.
///
/// Serialized as `{"status": "success", "value": ...}` or
/// `{"status": "failure", "kind": ..., "message": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success { value: Value },
    Failure(ExecutionFailure),
}

impl ExecutionResult {
    pub fn success(value: Value) -> Self {
        Self::Success { value }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure(ExecutionFailure {
            kind,
            message: message.into(),
            capability: None,
            reason: None,
        })
    }

    pub fn missing_identity() -> Self {
        Self::failure(
            FailureKind::MissingIdentity,
            "execution requires an authenticated identity",
        )
    }

    pub fn timeout(after: Duration) -> Self {
        Self::failure(
            FailureKind::Timeout,
            format!("execution exceeded {} ms", after.as_millis()),
        )
    }

    pub fn capability_failed(err: &CapabilityError) -> Self {
        Self::Failure(ExecutionFailure {
            kind: FailureKind::CapabilityFailed,
            message: err.to_string(),
            capability: Some(err.capability().to_string()),
            reason: Some(err.kind()),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success { value } => Some(value),
            Self::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ExecutionFailure> {
        match self {
            Self::Success { .. } => None,
            Self::Failure(failure) => Some(failure),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error().map(|f| f.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_serializes_with_status() {
        let result = ExecutionResult::success(json!(42));
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"status": "success", "value": 42})
        );
    }

    #[test]
    fn test_capability_failure_serialization() {
        let err = CapabilityError::Unauthorized {
            capability: "admin.purge".into(),
            required_role: "admin".into(),
        };
        let result = ExecutionResult::capability_failed(&err);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "capability_failed");
        assert_eq!(json["capability"], "admin.purge");
        assert_eq!(json["reason"], "unauthorized");
    }

    #[test]
    fn test_plain_failure_omits_capability_fields() {
        let result = ExecutionResult::failure(FailureKind::CompileFailed, "bad syntax");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            json!({"status": "failure", "kind": "compile_failed", "message": "bad syntax"})
        );
        let back: ExecutionResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_accessors() {
        let ok = ExecutionResult::success(json!("x"));
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&json!("x")));
        assert_eq!(ok.failure_kind(), None);

        let timed_out = ExecutionResult::timeout(Duration::from_millis(50));
        assert!(!timed_out.is_success());
        assert_eq!(timed_out.failure_kind(), Some(FailureKind::Timeout));
        assert!(timed_out.error().unwrap().message.contains("50 ms"));
    }
}
