//! Task types for the asynchronous path

use std::cmp::Ordering;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::{CompleteOptions, Completion};
use crate::types::LlmRequest;

/// Scheduling priority
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    /// Waiting out a backoff before the next run
    Retrying,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Queryable state of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: Uuid,
    pub state: TaskState,
    pub priority: Priority,
    /// Runs started so far
    pub runs: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Completion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatus {
    pub(crate) fn queued(id: Uuid, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: TaskState::Queued,
            priority,
            runs: 0,
            created_at: now,
            updated_at: now,
            next_run_at: None,
            result: None,
            error: None,
        }
    }
}

/// A request waiting in the queue
pub(crate) struct QueueItem {
    pub id: Uuid,
    pub priority: Priority,
    /// Enqueue order; retries keep their original position
    pub seq: u64,
    pub retries: u32,
    pub eligible_at: Instant,
    pub request: LlmRequest,
    pub options: CompleteOptions,
}

/// Ready-heap ordering: higher priority first, then older first
pub(crate) struct Ready(pub QueueItem);

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Delayed-heap ordering: earliest eligible time first
pub(crate) struct Delayed(pub QueueItem);

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .eligible_at
            .cmp(&self.0.eligible_at)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}
