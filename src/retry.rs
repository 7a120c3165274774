//! Retry policy: error classification, backoff, per-operation cancellation.
//!
//! Classification goes through a configurable rule table first, then falls
//! back to defaults keyed on the error kind. Rate-limited errors use a
//! longer cooldown that grows per attempt instead of the exponential curve.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
    RateLimited,
}

/// One classification rule. `kind` matches [`EngineError::kind`]; an empty
/// `message_contains` matches any message.
#[derive(Debug, Clone)]
pub struct ClassifyRule {
    pub kind: Option<&'static str>,
    pub message_contains: Option<String>,
    pub class: ErrorClass,
}

impl ClassifyRule {
    fn matches(&self, error: &EngineError) -> bool {
        if let Some(kind) = self.kind {
            if error.kind() != kind {
                return false;
            }
        }
        if let Some(needle) = &self.message_contains {
            if !error
                .to_string()
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase())
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Base cooldown after a rate-limited error.
    pub rate_limit_cooldown: Duration,
    /// The cooldown grows up to this multiple.
    pub rate_limit_max_growth: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
            rate_limit_cooldown: Duration::from_secs(60),
            rate_limit_max_growth: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RetryEvent {
    Scheduled {
        operation_id: String,
        attempt: u32,
        delay: Duration,
    },
    Succeeded {
        operation_id: String,
        attempts: u32,
    },
    Failed {
        operation_id: String,
        attempts: u32,
    },
}

#[derive(Debug, Default)]
pub struct RetryStats {
    pub operations: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

pub struct RetryManager {
    config: RetryConfig,
    rules: Vec<ClassifyRule>,
    cancellations: DashMap<String, CancellationToken>,
    events: broadcast::Sender<RetryEvent>,
    stats: RetryStats,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Arc<Self> {
        Self::with_rules(config, Vec::new())
    }

    pub fn with_rules(config: RetryConfig, rules: Vec<ClassifyRule>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(RetryManager {
            config,
            rules,
            cancellations: DashMap::new(),
            events,
            stats: RetryStats::default(),
        })
    }

    pub fn stats(&self) -> &RetryStats {
        &self.stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RetryEvent> {
        self.events.subscribe()
    }

    /// Classify one error: rule table first, then kind defaults.
    pub fn classify(&self, error: &EngineError) -> ErrorClass {
        for rule in &self.rules {
            if rule.matches(error) {
                return rule.class;
            }
        }

        let message = error.to_string().to_ascii_lowercase();
        if message.contains("rate limit")
            || message.contains("too many requests")
            || message.contains("429")
        {
            return ErrorClass::RateLimited;
        }

        match error {
            EngineError::Timeout { .. }
            | EngineError::Disconnected(_)
            | EngineError::Transport(_) => ErrorClass::Retryable,
            EngineError::Backpressure { .. } => ErrorClass::RateLimited,
            EngineError::Transfer { source, .. } => self.classify(source),
            EngineError::Protocol { .. }
            | EngineError::Schema(_)
            | EngineError::Aborted
            | EngineError::IncompleteDownload { .. }
            | EngineError::Session(_)
            | EngineError::Config(_) => ErrorClass::NonRetryable,
        }
    }

    /// Run `operation` with the retry policy. The id keys cancellation:
    /// a concurrent [`RetryManager::cancel`] aborts between attempts.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_id: &str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.stats.operations.fetch_add(1, Ordering::Relaxed);
        let cancel = self
            .cancellations
            .entry(operation_id.to_owned())
            .or_insert_with(CancellationToken::new)
            .clone();

        let result = self
            .run_attempts(operation_id, &cancel, &mut operation)
            .await;
        self.cancellations.remove(operation_id);
        result
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        operation_id: &str,
        cancel: &CancellationToken,
        operation: &mut F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 0..self.config.max_attempts {
            if cancel.is_cancelled() {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                return Err(EngineError::Aborted);
            }

            match operation().await {
                Ok(value) => {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    let _ = self.events.send(RetryEvent::Succeeded {
                        operation_id: operation_id.to_owned(),
                        attempts: attempt + 1,
                    });
                    return Ok(value);
                }
                Err(err) => {
                    let class = self.classify(&err);
                    let is_last = attempt + 1 == self.config.max_attempts;
                    if class == ErrorClass::NonRetryable || is_last {
                        if class == ErrorClass::NonRetryable {
                            debug!(
                                target: "retry",
                                operation = operation_id,
                                kind = err.kind(),
                                "Error is not retryable"
                            );
                        }
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        let _ = self.events.send(RetryEvent::Failed {
                            operation_id: operation_id.to_owned(),
                            attempts: attempt + 1,
                        });
                        return Err(err);
                    }

                    let delay = self.delay_for(class, attempt);
                    warn!(
                        target: "retry",
                        operation = operation_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        kind = err.kind(),
                        "Retrying after error"
                    );
                    self.stats.retries_scheduled.fetch_add(1, Ordering::Relaxed);
                    let _ = self.events.send(RetryEvent::Scheduled {
                        operation_id: operation_id.to_owned(),
                        attempt: attempt + 1,
                        delay,
                    });
                    last_error = Some(err);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                            return Err(EngineError::Aborted);
                        }
                    }
                }
            }
        }
        Err(last_error.unwrap_or(EngineError::Aborted))
    }

    /// Cancel a running `execute_with_retry` by id.
    pub fn cancel(&self, operation_id: &str) {
        if let Some(entry) = self.cancellations.get(operation_id) {
            entry.cancel();
        }
    }

    fn delay_for(&self, class: ErrorClass, attempt: u32) -> Duration {
        match class {
            ErrorClass::RateLimited => {
                let growth = (attempt + 1).min(self.config.rate_limit_max_growth);
                self.config.rate_limit_cooldown * growth
            }
            _ => {
                let base = self.config.initial_delay.as_millis() as f64
                    * self.config.backoff_factor.powi(attempt.min(16) as i32);
                let capped = base.min(self.config.max_delay.as_millis() as f64);
                let jitter = rand::thread_rng().gen_range(0.9..=1.1);
                Duration::from_millis((capped * jitter) as u64)
            }
        }
    }
}
