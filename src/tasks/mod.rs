//! Bounded-concurrency task scheduling.

pub mod models;
pub mod scheduler;

pub use models::{TaskId, TaskPriority, TaskSpec, TaskStats, TaskStatus};
pub use scheduler::{ConcurrencyManager, SchedulerConfig};
