//! Job step database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

use crate::action::SerializedError;

/// Step status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStepStatus {
    /// Step is awaiting its callback result.
    Active,
    /// Step finished successfully.
    Completed,
    /// Step failed terminally.
    Failed,
    /// Step was cancelled.
    Cancelled,
}

impl JobStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// One recorded failed attempt in a step's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    /// When the attempt failed (epoch ms).
    pub failed_at: i64,
    /// Serialized error of the attempt.
    pub error: SerializedError,
    /// Backoff delay scheduled after the failure (ms).
    pub delayed_ms: i64,
}

/// Failure history: epoch-ms slot (stringified, strictly monotone per step)
/// to the recorded attempt.
pub type FailedAttemptHistory = BTreeMap<String, FailedAttempt>;

/// Job step database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobStepDbModel {
    pub id: String,
    pub job_id: String,
    /// Step name, unique per job; recovery identity.
    pub name: String,
    /// Status: ACTIVE, COMPLETED, FAILED, CANCELLED
    pub status: String,
    /// JSON blob with the callback result (COMPLETED only).
    pub output: Option<String>,
    /// Serialized error (FAILED/CANCELLED).
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub timeout_ms: i64,
    /// Lease deadline; extended on every retry delay.
    pub expires_at: Option<i64>,
    pub retries_limit: i64,
    pub retries_count: i64,
    /// Last scheduled backoff delay (ms), if any.
    pub delayed_ms: Option<i64>,
    /// JSON map of failed attempts keyed by a monotone time slot.
    pub history_failed_attempts: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobStepDbModel {
    /// Get the step status as an enum.
    pub fn get_status(&self) -> Option<JobStepStatus> {
        JobStepStatus::parse(&self.status)
    }

    /// Parse the failure history; malformed JSON yields an empty map.
    pub fn get_history(&self) -> FailedAttemptHistory {
        serde_json::from_str(&self.history_failed_attempts).unwrap_or_default()
    }
}

/// Result of `create_or_recover_job_step`: the fields the step wrapper needs
/// to decide between fresh execution, recovery, and terminal short-circuit.
#[derive(Debug, Clone)]
pub struct StepRow {
    pub id: String,
    pub status: JobStepStatus,
    pub retries_limit: i64,
    pub retries_count: i64,
    pub timeout_ms: i64,
    pub error: Option<String>,
    pub output: Option<String>,
    /// True when the row was inserted by this call.
    pub is_new: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStepStatus::Active,
            JobStepStatus::Completed,
            JobStepStatus::Failed,
            JobStepStatus::Cancelled,
        ] {
            assert_eq!(JobStepStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStepStatus::parse(""), None);
    }

    #[test]
    fn test_history_parses_and_defaults() {
        let mut step = JobStepDbModel {
            id: "s1".into(),
            job_id: "j1".into(),
            name: "fetch".into(),
            status: "ACTIVE".into(),
            output: None,
            error: None,
            started_at: Some(0),
            finished_at: None,
            timeout_ms: 1000,
            expires_at: Some(1000),
            retries_limit: 4,
            retries_count: 0,
            delayed_ms: None,
            history_failed_attempts: "{}".into(),
            created_at: 0,
            updated_at: 0,
        };
        assert!(step.get_history().is_empty());

        step.history_failed_attempts = "not json".into();
        assert!(step.get_history().is_empty());

        let mut history = FailedAttemptHistory::new();
        history.insert(
            "1000".into(),
            FailedAttempt {
                failed_at: 1000,
                error: SerializedError::new("Error", "boom"),
                delayed_ms: 20,
            },
        );
        step.history_failed_attempts = serde_json::to_string(&history).unwrap();
        assert_eq!(step.get_history(), history);
    }
}
