//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job is queued and waiting to be admitted.
    Created,
    /// Job is leased by a worker and executing.
    Active,
    /// Job finished successfully.
    Completed,
    /// Job failed.
    Failed,
    /// Job was cancelled.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(Self::Created),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Job database model.
///
/// One scheduled execution of an action. `input`/`output`/`error` are JSON
/// blobs; instants are epoch milliseconds.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub action_name: String,
    pub group_key: String,
    /// Status: CREATED, ACTIVE, COMPLETED, FAILED, CANCELLED
    pub status: String,
    /// Content hash of the action identity; drives recovery and retry dedup.
    pub checksum: String,
    /// JSON blob with the producer-supplied input.
    pub input: String,
    /// JSON blob with the handler output (terminal COMPLETED only).
    pub output: Option<String>,
    /// Serialized error (terminal FAILED/CANCELLED).
    pub error: Option<String>,
    pub timeout_ms: i64,
    /// Lease deadline while ACTIVE (started_at + timeout_ms).
    pub expires_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Worker instance owning the lease while ACTIVE.
    pub client_id: Option<String>,
    /// Group admission limit carried by the job itself.
    pub concurrency_limit: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobDbModel {
    /// Create a new CREATED job row.
    pub fn new(
        action_name: impl Into<String>,
        group_key: impl Into<String>,
        input: impl Into<String>,
        timeout_ms: i64,
        checksum: impl Into<String>,
        concurrency_limit: i64,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action_name: action_name.into(),
            group_key: group_key.into(),
            status: JobStatus::Created.as_str().to_string(),
            checksum: checksum.into(),
            input: input.into(),
            output: None,
            error: None,
            timeout_ms,
            expires_at: None,
            started_at: None,
            finished_at: None,
            client_id: None,
            concurrency_limit,
            created_at: now,
            updated_at: now,
        }
    }

    /// Get the job status as an enum.
    pub fn get_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    /// Check whether the persisted status is terminal.
    pub fn is_terminal(&self) -> bool {
        self.get_status().is_some_and(|s| s.is_terminal())
    }
}

/// Sort column for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    FinishedAt,
    ActionName,
    Status,
}

impl JobSortField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::FinishedAt => "finished_at",
            Self::ActionName => "action_name",
            Self::Status => "status",
        }
    }
}

/// Sort direction for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Sort specification for job listings.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobSort {
    pub field: JobSortField,
    pub direction: SortDirection,
}

/// Filter criteria for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    /// Filter by job status.
    pub status: Option<JobStatus>,
    /// Filter by action name.
    pub action_name: Option<String>,
    /// Filter by group key.
    pub group_key: Option<String>,
    /// Filter by owning client id.
    pub client_id: Option<String>,
    /// Filter jobs created at or after this instant (epoch ms).
    pub from_ms: Option<i64>,
    /// Filter jobs created before this instant (epoch ms).
    pub to_ms: Option<i64>,
    /// Substring search over id and input.
    pub search: Option<String>,
}

impl JobFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_action_name(mut self, action_name: impl Into<String>) -> Self {
        self.action_name = Some(action_name.into());
        self
    }

    pub fn with_group_key(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_date_range(mut self, from_ms: Option<i64>, to_ms: Option<i64>) -> Self {
        self.from_ms = from_ms;
        self.to_ms = to_ms;
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }
}

/// Pagination parameters for list queries.
#[derive(Debug, Clone)]
pub struct Pagination {
    /// Maximum number of items to return.
    pub limit: u32,
    /// Number of items to skip.
    pub offset: u32,
}

impl Pagination {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub created: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.created + self.active + self.completed + self.failed + self.cancelled
    }
}

/// Per-action aggregate: count-by-status plus the latest creation instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSummary {
    pub action_name: String,
    pub counts: JobCounts,
    pub last_created_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Created,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("NOPE"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Created.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_new_job_invariants() {
        let job = JobDbModel::new("send-email", "@default", "{}", 60_000, "abc", 10);
        assert_eq!(job.get_status(), Some(JobStatus::Created));
        assert!(job.started_at.is_none());
        assert!(job.expires_at.is_none());
        assert!(job.client_id.is_none());
        assert_eq!(job.created_at, job.updated_at);
    }
}
