use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Current wall-clock time in milliseconds, the timestamp unit used on the
/// wire.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn is_zero(count: &u32) -> bool {
    *count == 0
}

/// A job message as published to the jobs queue.
///
/// Created by a scheduler; `retry_count` is only ever mutated by an agent
/// incrementing it on a retry-requeue, and stays off the wire until the
/// first retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Submission time, milliseconds.
    pub at: i64,
    pub job_id: String,
    pub job_type: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
}

impl Job {
    pub fn new(job_type: impl Into<String>, data: Value) -> Self {
        Self {
            at: now_millis(),
            job_id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            data,
            retry_count: 0,
        }
    }

    /// Copy of this job with the retry counter bumped, for republishing.
    pub fn with_retry(&self) -> Self {
        let mut job = self.clone();
        job.retry_count += 1;
        job
    }
}

/// A result message as published to the results queue, exactly one per
/// successfully responded job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// Response time, milliseconds.
    pub at: i64,
    /// Submission time of the originating job.
    pub job_at: i64,
    pub job_id: String,
    pub job_type: String,
    pub data: Value,
}

/// Job-level failure categories carried in a result's `data.error` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "INVALID_JOB")]
    InvalidJob,
    #[serde(rename = "JOB_FAILED")]
    JobFailed,
    #[serde(rename = "VALIDATION_UNCAUGHT_EXCEPTION")]
    ValidationUncaughtException,
    #[serde(rename = "RUN_UNCAUGHT_EXCEPTION")]
    RunUncaughtException,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            FailureKind::InvalidJob => "INVALID_JOB",
            FailureKind::JobFailed => "JOB_FAILED",
            FailureKind::ValidationUncaughtException => "VALIDATION_UNCAUGHT_EXCEPTION",
            FailureKind::RunUncaughtException => "RUN_UNCAUGHT_EXCEPTION",
        };
        write!(f, "{}", kind)
    }
}

/// Failure payload published instead of a success payload, so result
/// consumers can branch on the presence of `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub error: FailureKind,
    /// Diagnostic string (error message or panic payload).
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_job: Option<Job>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_result: Option<Value>,
}

impl FailureReport {
    pub fn invalid_job(data: impl Into<String>, job: &Job) -> Self {
        Self {
            error: FailureKind::InvalidJob,
            data: data.into(),
            original_job: Some(job.clone()),
            partial_result: None,
        }
    }

    pub fn job_failed(data: impl Into<String>, partial_result: Option<Value>) -> Self {
        Self {
            error: FailureKind::JobFailed,
            data: data.into(),
            original_job: None,
            partial_result,
        }
    }

    pub fn uncaught(kind: FailureKind, data: impl Into<String>, job: Option<&Job>) -> Self {
        Self {
            error: kind,
            data: data.into(),
            original_job: job.cloned(),
            partial_result: None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Failure returned by [`JobHandler::validate`](crate::JobHandler::validate).
/// Always dead-letters the job, never retried.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl From<String> for ValidationError {
    fn from(message: String) -> Self {
        ValidationError(message)
    }
}

impl From<&str> for ValidationError {
    fn from(message: &str) -> Self {
        ValidationError(message.to_string())
    }
}

/// Failure returned by [`JobHandler::run`](crate::JobHandler::run).
///
/// A plain failure dead-letters the job; `reject` + `requeue` request a
/// retry (bounded by the agent's `max_retries`), optionally after
/// `requeue_delay`, optionally preserving a partial result for diagnostics.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RunError {
    pub message: String,
    pub reject: bool,
    pub requeue: bool,
    pub requeue_delay: Option<Duration>,
    pub partial_result: Option<Value>,
}

impl RunError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reject: false,
            requeue: false,
            requeue_delay: None,
            partial_result: None,
        }
    }

    pub fn reject(message: impl Into<String>, requeue: bool) -> Self {
        Self {
            message: message.into(),
            reject: true,
            requeue,
            requeue_delay: None,
            partial_result: None,
        }
    }

    pub fn reject_after(message: impl Into<String>, requeue: bool, delay: Duration) -> Self {
        Self {
            message: message.into(),
            reject: true,
            requeue,
            requeue_delay: Some(delay),
            partial_result: None,
        }
    }

    pub fn with_partial_result(mut self, partial_result: Value) -> Self {
        self.partial_result = Some(partial_result);
        self
    }
}

impl From<String> for RunError {
    fn from(message: String) -> Self {
        RunError::new(message)
    }
}

impl From<&str> for RunError {
    fn from(message: &str) -> Self {
        RunError::new(message)
    }
}
