//! Task records and their failure taxonomy.
//!
//! A task is one unit of queued work. Downloads carry bound parameters;
//! persists additionally carry the downloaded frame by value, so a queue row
//! is self-contained and survives a restart. The correlation id ties a
//! download to its paired persist for tracing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::fetch::FetchError;
use crate::frame::Frame;

/// The three isolated queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Fast,
    Slow,
    Maint,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Fast, QueueName::Slow, QueueName::Maint];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
            Self::Maint => "maint",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Expand a task group into per-symbol downloads
    Plan,
    /// Run one fetcher against the vendor
    Download,
    /// Apply a downloaded frame to the lake
    Persist,
    /// Housekeeping: manifest rebuild, compaction, sweep
    Maintenance,
}

impl TaskKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Download => "download",
            Self::Persist => "persist",
            Self::Maintenance => "maintenance",
        }
    }

    /// Which queue admits this kind.
    pub const fn queue(self) -> QueueName {
        match self {
            Self::Download => QueueName::Fast,
            Self::Plan | Self::Persist => QueueName::Slow,
            Self::Maintenance => QueueName::Maint,
        }
    }
}

/// Maintenance operations accepted from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintKind {
    RebuildManifest,
    Compact,
    Sweep,
}

impl MaintKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RebuildManifest => "rebuild_manifest",
            Self::Compact => "compact",
            Self::Sweep => "sweep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rebuild_manifest" => Some(Self::RebuildManifest),
            "compact" => Some(Self::Compact),
            "sweep" => Some(Self::Sweep),
            _ => None,
        }
    }
}

/// Bound call parameters for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Security identifier, for per-symbol datasets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Inclusive range start, compact `YYYYMMDD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Inclusive range end, compact `YYYYMMDD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Overrides of declared default parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A queued unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    /// Queue-store row id; 0 until enqueued
    pub id: i64,
    pub kind: TaskKind,
    /// Dataset name (download/persist), group name (plan), or maintenance kind
    pub task_name: String,
    pub params: TaskParams,
    /// Ties a download to its paired persist
    pub correlation_id: Uuid,
    /// 0-based retry counter
    pub attempt: u32,
    /// Downloaded frame, persist tasks only; carried by value
    pub payload: Option<Frame>,
}

impl Task {
    pub fn plan(group: impl Into<String>) -> Self {
        Self {
            id: 0,
            kind: TaskKind::Plan,
            task_name: group.into(),
            params: TaskParams::default(),
            correlation_id: Uuid::new_v4(),
            attempt: 0,
            payload: None,
        }
    }

    pub fn download(task_name: impl Into<String>, params: TaskParams) -> Self {
        Self {
            id: 0,
            kind: TaskKind::Download,
            task_name: task_name.into(),
            params,
            correlation_id: Uuid::new_v4(),
            attempt: 0,
            payload: None,
        }
    }

    /// The persist paired with a completed download: same name, same params,
    /// same correlation id, plus the payload.
    pub fn persist(download: &Task, payload: Frame) -> Self {
        Self {
            id: 0,
            kind: TaskKind::Persist,
            task_name: download.task_name.clone(),
            params: download.params.clone(),
            correlation_id: download.correlation_id,
            attempt: 0,
            payload: Some(payload),
        }
    }

    pub fn maintenance(kind: MaintKind) -> Self {
        Self {
            id: 0,
            kind: TaskKind::Maintenance,
            task_name: kind.as_str().to_string(),
            params: TaskParams::default(),
            correlation_id: Uuid::new_v4(),
            attempt: 0,
            payload: None,
        }
    }
}

// ============================================================================
// Failure taxonomy
// ============================================================================

/// How a task execution failed, as seen by the worker loop.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Worth re-enqueueing with backoff
    #[error("transient failure ({kind}): {message}")]
    Transient { kind: String, message: String },

    /// Dead-letter immediately
    #[error("permanent failure ({kind}): {message}")]
    Permanent { kind: String, message: String },

    /// Process cancellation observed; the task ends as a succeeded no-op
    #[error("cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn transient(kind: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transient {
            kind: kind.into(),
            message: message.to_string(),
        }
    }

    pub fn permanent(kind: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Permanent {
            kind: kind.into(),
            message: message.to_string(),
        }
    }

    /// Stable label for dead-letter records.
    pub fn kind(&self) -> &str {
        match self {
            Self::Transient { kind, .. } | Self::Permanent { kind, .. } => kind,
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<FetchError> for TaskError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => Self::Cancelled,
            ref e if e.is_transient() => Self::transient(e.kind(), e),
            ref e => Self::permanent(e.kind(), e),
        }
    }
}

/// Exponential backoff for a retry attempt, capped at one minute.
pub fn backoff(attempt: u32, base_delay_ms: u64) -> Duration {
    let factor = 1u64 << attempt.min(16);
    Duration::from_millis((base_delay_ms.saturating_mul(factor)).min(60_000))
}

/// A permanently failed task, kept for operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task_kind: TaskKind,
    pub task_name: String,
    pub params: TaskParams,
    pub attempts: u32,
    pub last_error_kind: String,
    pub last_error_message: String,
}
