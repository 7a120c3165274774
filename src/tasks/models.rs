//! Task model for the bounded-concurrency scheduler.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type TaskId = String;

/// Higher value runs first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Submission parameters.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub priority: TaskPriority,
    /// Soft deadline: the task is marked timed-out but the operation itself
    /// is only cancelled cooperatively.
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>) -> Self {
        TaskSpec {
            name: name.into(),
            priority: TaskPriority::Normal,
            timeout: None,
            max_retries: 0,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }
}

/// Aggregate scheduler counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub avg_wait_ms: f64,
    pub avg_exec_ms: f64,
}
