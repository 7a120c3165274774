//! Priority scheduler with bounded parallelism.
//!
//! Tasks queue by priority (FIFO within a priority level) and run under a
//! semaphore cap. Timeouts mark the task; retries re-enqueue it after a
//! delay until the budget runs out.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::tasks::models::{TaskId, TaskSpec, TaskStats, TaskStatus};

type TaskFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;
/// Re-invokable so a failed task can retry.
type TaskExecutor = Box<dyn FnMut() -> TaskFuture + Send>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { max_concurrent: 4 }
    }
}

struct QueuedTask {
    id: TaskId,
    spec: TaskSpec,
    executor: TaskExecutor,
    /// Retries already consumed.
    attempts: u32,
    enqueued_at: Instant,
    /// FIFO tie-breaker within a priority level.
    sequence: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.spec.priority == other.spec.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence (earlier
        // submission) first.
        self.spec
            .priority
            .cmp(&other.spec.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct Timings {
    wait_ms_total: f64,
    wait_samples: u64,
    exec_ms_total: f64,
    exec_samples: u64,
}

/// Bounded-parallelism task runner.
pub struct ConcurrencyManager {
    config: SchedulerConfig,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    queue_signal: Notify,
    permits: Arc<Semaphore>,
    statuses: DashMap<TaskId, TaskStatus>,
    cancel_flags: DashMap<TaskId, CancellationToken>,
    sequence: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    timings: Mutex<Timings>,
    shutdown: CancellationToken,
}

impl ConcurrencyManager {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        let manager = Arc::new(ConcurrencyManager {
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            queue: Mutex::new(BinaryHeap::new()),
            queue_signal: Notify::new(),
            statuses: DashMap::new(),
            cancel_flags: DashMap::new(),
            sequence: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            timings: Mutex::new(Timings::default()),
            shutdown: CancellationToken::new(),
        });
        manager.spawn_dispatcher();
        info!(
            target: "tasks::scheduler",
            concurrency = manager.config.max_concurrent,
            "Task scheduler started"
        );
        manager
    }

    /// Queue a task. The executor is called once per attempt.
    pub fn submit<F, Fut>(&self, spec: TaskSpec, mut operation: F) -> TaskId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let executor: TaskExecutor = Box::new(move || Box::pin(operation()));
        self.statuses.insert(id.clone(), TaskStatus::Pending);
        self.cancel_flags
            .insert(id.clone(), CancellationToken::new());
        self.enqueue(QueuedTask {
            id: id.clone(),
            spec,
            executor,
            attempts: 0,
            enqueued_at: Instant::now(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        });
        id
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.statuses.get(id).map(|entry| *entry.value())
    }

    /// Request cooperative cancellation. Pending tasks are dropped at
    /// dispatch; running tasks observe the token.
    pub fn cancel(&self, id: &str) {
        if let Some(flag) = self.cancel_flags.get(id) {
            flag.cancel();
        }
        if let Some(mut status) = self.statuses.get_mut(id) {
            if *status == TaskStatus::Pending {
                *status = TaskStatus::Cancelled;
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Token a task body can select on for cooperative cancellation.
    pub fn cancellation_token(&self, id: &str) -> Option<CancellationToken> {
        self.cancel_flags.get(id).map(|flag| flag.clone())
    }

    pub fn stats(&self) -> TaskStats {
        let pending = self.queue.lock().expect("queue lock").len();
        let running = self
            .statuses
            .iter()
            .filter(|entry| *entry.value() == TaskStatus::Running)
            .count();
        let timings = self.timings.lock().expect("timings lock");
        TaskStats {
            pending,
            running,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            avg_wait_ms: average(timings.wait_ms_total, timings.wait_samples),
            avg_exec_ms: average(timings.exec_ms_total, timings.exec_samples),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.cancel_flags.iter() {
            entry.value().cancel();
        }
    }

    fn enqueue(&self, task: QueuedTask) {
        self.queue.lock().expect("queue lock").push(task);
        self.queue_signal.notify_one();
    }

    fn spawn_dispatcher(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                // Hold a free slot before popping so the queue keeps
                // accumulating (and re-ordering by priority) while all
                // workers are busy.
                let permit = tokio::select! {
                    permit = manager.permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = manager.shutdown.cancelled() => return,
                };

                let task = loop {
                    if manager.shutdown.is_cancelled() {
                        return;
                    }
                    if let Some(task) = manager.queue.lock().expect("queue lock").pop() {
                        break task;
                    }
                    tokio::select! {
                        _ = manager.queue_signal.notified() => {}
                        _ = manager.shutdown.cancelled() => return,
                    }
                };

                let runner = Arc::clone(&manager);
                tokio::spawn(async move {
                    runner.run_task(task).await;
                    drop(permit);
                });
            }
        });
    }

    async fn run_task(self: &Arc<Self>, mut task: QueuedTask) {
        // Cancelled while queued: drop without running.
        if self.status(&task.id) == Some(TaskStatus::Cancelled) {
            debug!(target: "tasks::scheduler", task = %task.id, "Skipping cancelled task");
            return;
        }

        let waited = task.enqueued_at.elapsed();
        {
            let mut timings = self.timings.lock().expect("timings lock");
            timings.wait_ms_total += waited.as_secs_f64() * 1000.0;
            timings.wait_samples += 1;
        }
        self.statuses.insert(task.id.clone(), TaskStatus::Running);

        let cancel = self
            .cancellation_token(&task.id)
            .unwrap_or_else(CancellationToken::new);
        let started = Instant::now();
        let work = (task.executor)();

        let outcome: TaskOutcome = match task.spec.timeout {
            Some(limit) => {
                tokio::select! {
                    result = tokio::time::timeout(limit, work) => match result {
                        Ok(result) => TaskOutcome::Finished(result),
                        Err(_) => TaskOutcome::TimedOut,
                    },
                    _ = cancel.cancelled() => TaskOutcome::Cancelled,
                }
            }
            None => {
                tokio::select! {
                    result = work => TaskOutcome::Finished(result),
                    _ = cancel.cancelled() => TaskOutcome::Cancelled,
                }
            }
        };

        {
            let mut timings = self.timings.lock().expect("timings lock");
            timings.exec_ms_total += started.elapsed().as_secs_f64() * 1000.0;
            timings.exec_samples += 1;
        }

        match outcome {
            TaskOutcome::Finished(Ok(())) => {
                self.statuses.insert(task.id.clone(), TaskStatus::Completed);
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.cancel_flags.remove(&task.id);
            }
            TaskOutcome::Finished(Err(message)) => {
                if task.attempts < task.spec.max_retries {
                    task.attempts += 1;
                    warn!(
                        target: "tasks::scheduler",
                        task = %task.id,
                        name = %task.spec.name,
                        attempt = task.attempts,
                        error = %message,
                        "Task failed, re-queueing"
                    );
                    self.statuses.insert(task.id.clone(), TaskStatus::Pending);
                    let manager = Arc::clone(self);
                    let delay = task.spec.retry_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        task.enqueued_at = Instant::now();
                        manager.enqueue(task);
                    });
                } else {
                    warn!(
                        target: "tasks::scheduler",
                        task = %task.id,
                        name = %task.spec.name,
                        error = %message,
                        "Task failed permanently"
                    );
                    self.statuses.insert(task.id.clone(), TaskStatus::Failed);
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    self.cancel_flags.remove(&task.id);
                }
            }
            TaskOutcome::TimedOut => {
                self.statuses.insert(task.id.clone(), TaskStatus::TimedOut);
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                self.cancel_flags.remove(&task.id);
            }
            TaskOutcome::Cancelled => {
                self.statuses.insert(task.id.clone(), TaskStatus::Cancelled);
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                self.cancel_flags.remove(&task.id);
            }
        }
    }
}

enum TaskOutcome {
    Finished(std::result::Result<(), String>),
    TimedOut,
    Cancelled,
}

fn average(total_ms: f64, samples: u64) -> f64 {
    if samples == 0 {
        0.0
    } else {
        total_ms / samples as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::models::TaskPriority;
    use std::sync::atomic::AtomicUsize;

    async fn wait_for_status(
        manager: &ConcurrencyManager,
        id: &str,
        expected: TaskStatus,
    ) -> bool {
        for _ in 0..200 {
            if manager.status(id) == Some(expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn runs_tasks_to_completion() {
        let manager = ConcurrencyManager::new(SchedulerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&counter);
        let id = manager.submit(TaskSpec::new("count"), move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert!(wait_for_status(&manager, &id, TaskStatus::Completed).await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let manager = ConcurrencyManager::new(SchedulerConfig { max_concurrent: 2 });
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for _ in 0..8 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            ids.push(manager.submit(TaskSpec::new("load"), move || {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }
        for id in &ids {
            assert!(wait_for_status(&manager, id, TaskStatus::Completed).await);
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        manager.shutdown();
    }

    #[tokio::test]
    async fn failed_tasks_retry_then_fail() {
        let manager = ConcurrencyManager::new(SchedulerConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&calls);
        let id = manager.submit(
            TaskSpec::new("flaky").with_retries(2, Duration::from_millis(5)),
            move || {
                inner.fetch_add(1, Ordering::SeqCst);
                async { Err("boom".to_owned()) }
            },
        );
        assert!(wait_for_status(&manager, &id, TaskStatus::Failed).await);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        manager.shutdown();
    }

    #[tokio::test]
    async fn timeout_marks_the_task() {
        let manager = ConcurrencyManager::new(SchedulerConfig::default());
        let id = manager.submit(
            TaskSpec::new("slow").with_timeout(Duration::from_millis(10)),
            || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            },
        );
        assert!(wait_for_status(&manager, &id, TaskStatus::TimedOut).await);
        assert_eq!(manager.stats().timed_out, 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn priorities_run_before_later_submissions() {
        // Single worker: occupy it, then queue low and critical; the
        // critical task must run first even though it was submitted last.
        let manager = ConcurrencyManager::new(SchedulerConfig { max_concurrent: 1 });
        let order = Arc::new(Mutex::new(Vec::new()));

        let gate = Arc::new(Notify::new());
        let gate_wait = Arc::clone(&gate);
        let blocker = manager.submit(TaskSpec::new("blocker"), move || {
            let gate_wait = Arc::clone(&gate_wait);
            async move {
                gate_wait.notified().await;
                Ok(())
            }
        });
        // Give the blocker time to occupy the single slot.
        tokio::time::sleep(Duration::from_millis(20)).await;

        for (name, priority) in [("low", TaskPriority::Low), ("crit", TaskPriority::Critical)] {
            let order = Arc::clone(&order);
            manager.submit(TaskSpec::new(name).with_priority(priority), move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                }
            });
        }
        gate.notify_one();
        assert!(wait_for_status(&manager, &blocker, TaskStatus::Completed).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec!["crit", "low"]);
        manager.shutdown();
    }

    #[tokio::test]
    async fn pending_cancellation_skips_execution() {
        let manager = ConcurrencyManager::new(SchedulerConfig { max_concurrent: 1 });
        let gate = Arc::new(Notify::new());
        let gate_wait = Arc::clone(&gate);
        manager.submit(TaskSpec::new("blocker"), move || {
            let gate_wait = Arc::clone(&gate_wait);
            async move {
                gate_wait.notified().await;
                Ok(())
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ran = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&ran);
        let id = manager.submit(TaskSpec::new("victim"), move || {
            inner.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        manager.cancel(&id);
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.status(&id), Some(TaskStatus::Cancelled));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        manager.shutdown();
    }
}
