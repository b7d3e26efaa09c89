//! Handler-facing error types and the serialized error shape.
//!
//! `JobError` is what handlers and step callbacks return; `SerializedError`
//! is the `{name, message, cause?, stack?}` shape persisted in job and step
//! error columns and in step failure history.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for handlers and step callbacks.
pub type JobResult<T> = Result<T, JobError>;

/// Error name that marks an error (or any of its causes) as non-retriable.
pub const NON_RETRIABLE_NAME: &str = "NonRetriableError";

/// Serialized error shape stored verbatim in error columns.
///
/// `cause` nests recursively; `stack` is optional and may be lossy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            cause: None,
            stack: None,
        }
    }

    pub fn with_cause(mut self, cause: SerializedError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// True when this error or any transitive cause carries the
    /// non-retriable marker.
    pub fn is_non_retriable(&self) -> bool {
        if self.name == NON_RETRIABLE_NAME {
            return true;
        }
        self.cause.as_deref().is_some_and(Self::is_non_retriable)
    }

    /// Serialize to the stored JSON string. Serialization of this shape
    /// cannot fail; a formatting fallback keeps the write path infallible.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"name\":\"SerializationError\",\"message\":{:?}}}",
                self.message
            )
        })
    }

    /// Parse a stored error column. Plain strings from foreign writers are
    /// wrapped instead of rejected.
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::new("Error", raw))
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Errors raised by handlers, step callbacks, and the execution machinery.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Retry is futile; finalise immediately.
    #[error("{0}")]
    NonRetriable(SerializedError),

    /// The job-level timer fired.
    #[error("action timed out after {timeout_ms}ms")]
    ActionTimeout { timeout_ms: i64 },

    /// The step-level timer fired.
    #[error("step '{name}' timed out after {timeout_ms}ms")]
    StepTimeout { name: String, timeout_ms: i64 },

    /// Explicit cancellation.
    #[error("action cancelled")]
    ActionCancel,

    /// A handler invoked the same step name twice in one run.
    #[error("step '{0}' already executed in this run")]
    StepAlreadyExecuted(String),

    /// Input or output did not satisfy the action's schema.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A store operation failed; retriable at the step level.
    #[error("store error: {0}")]
    Store(String),

    /// Generic handler failure carrying a serialized error.
    #[error("{0}")]
    Failed(SerializedError),
}

impl JobError {
    /// A non-retriable failure with the given message.
    pub fn non_retriable(message: impl Into<String>) -> Self {
        Self::NonRetriable(SerializedError::new(NON_RETRIABLE_NAME, message))
    }

    /// A retriable failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(SerializedError::new("Error", message))
    }

    /// A retriable failure with an explicit cause chain.
    pub fn failed_with_cause(message: impl Into<String>, cause: SerializedError) -> Self {
        Self::Failed(SerializedError::new("Error", message).with_cause(cause))
    }

    /// True when the error must bypass step retry.
    pub fn is_non_retriable(&self) -> bool {
        match self {
            Self::NonRetriable(_)
            | Self::ActionTimeout { .. }
            | Self::StepTimeout { .. }
            | Self::ActionCancel
            | Self::StepAlreadyExecuted(_)
            | Self::Validation(_) => true,
            Self::Failed(err) => err.is_non_retriable(),
            Self::Store(_) => false,
        }
    }

    /// True when the error represents a cancellation.
    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::ActionCancel)
    }

    /// The serialized shape persisted in error columns.
    pub fn serialized(&self) -> SerializedError {
        match self {
            Self::NonRetriable(err) | Self::Failed(err) => err.clone(),
            Self::ActionTimeout { .. } => {
                SerializedError::new("ActionTimeoutError", self.to_string())
            }
            Self::StepTimeout { .. } => SerializedError::new("StepTimeoutError", self.to_string()),
            Self::ActionCancel => SerializedError::new("ActionCancelError", self.to_string()),
            Self::StepAlreadyExecuted(_) => {
                SerializedError::new("StepAlreadyExecutedError", self.to_string())
            }
            Self::Validation(_) => SerializedError::new("ValidationError", self.to_string()),
            Self::Store(_) => SerializedError::new("StoreError", self.to_string()),
        }
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::failed(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::failed(message)
    }
}

impl From<crate::Error> for JobError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Validation(msg) => Self::Validation(msg),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_error_round_trip() {
        let err = SerializedError::new("Error", "outer")
            .with_cause(SerializedError::new("IoError", "inner"));
        let parsed = SerializedError::from_json(&err.to_json());
        assert_eq!(parsed, err);
        assert_eq!(parsed.cause.as_ref().unwrap().message, "inner");
    }

    #[test]
    fn test_plain_string_errors_are_wrapped() {
        let parsed = SerializedError::from_json("disk full");
        assert_eq!(parsed.name, "Error");
        assert_eq!(parsed.message, "disk full");
    }

    #[test]
    fn test_non_retriable_cause_chain() {
        let direct = JobError::non_retriable("stop");
        assert!(direct.is_non_retriable());

        let nested = JobError::failed_with_cause(
            "wrapper",
            SerializedError::new("Error", "mid")
                .with_cause(SerializedError::new(NON_RETRIABLE_NAME, "root")),
        );
        assert!(nested.is_non_retriable());

        let plain = JobError::failed("transient");
        assert!(!plain.is_non_retriable());
    }

    #[test]
    fn test_timeout_and_cancel_bypass_retry() {
        assert!(JobError::ActionTimeout { timeout_ms: 5 }.is_non_retriable());
        assert!(JobError::StepTimeout {
            name: "s".into(),
            timeout_ms: 5
        }
        .is_non_retriable());
        assert!(JobError::ActionCancel.is_non_retriable());
        assert!(JobError::ActionCancel.is_cancel());
        assert!(!JobError::Store("busy".into()).is_non_retriable());
    }
}
