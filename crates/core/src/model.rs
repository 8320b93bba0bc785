use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity + policy for a job type. Immutable once a job references it.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct JobDefinition {
    pub key: String,
    pub version: i32,
    pub default_max_attempts: i32,
    pub timeout_seconds: i32,
    pub concurrency_limit: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelling,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "succeeded" => JobStatus::Succeeded,
            "failed" => JobStatus::Failed,
            "cancelling" => JobStatus::Cancelling,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub definition_key: String,
    pub definition_version: i32,
    pub params: Value,
    pub status: String,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,

    pub scheduled_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,

    pub worker_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub error_summary: Option<String>,
}

impl Job {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::from_str(&self.status)
    }
}

/// Caller-supplied submission request (§6 submission facade).
#[derive(Debug, Clone)]
pub struct NewJob {
    pub definition_key: String,
    pub definition_version: i32,
    pub params: Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: Uuid,
    pub event_type: String,
    pub at: DateTime<Utc>,
    pub payload: Option<Value>,
}

/// Immutable snapshot of a terminally failed job, preserved for audit.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct DlqJob {
    pub id: Uuid,
    pub original_job_id: Uuid,
    pub definition_key: String,
    pub definition_version: i32,
    pub params: Value,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
    pub error_summary: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub moved_to_dlq_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub definition_key: String,
    pub definition_version: i32,
    pub cron_expression: String,
    pub params: Value,
    pub priority: i32,
    pub enabled: bool,
    pub last_enqueued_at: Option<DateTime<Utc>>,
}

/// Truncate an error message to the persisted `error_summary` limit.
pub fn truncate_error_summary(msg: &str) -> String {
    const MAX: usize = 500;
    if msg.chars().count() <= MAX {
        msg.to_string()
    } else {
        msg.chars().take(MAX).collect()
    }
}
