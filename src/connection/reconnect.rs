//! Automatic reconnection driven by state machine events.
//!
//! When the machine drops out of CONNECTED into DISCONNECTED and
//! auto-reconnect is enabled, the supervisor schedules attempts with
//! exponential backoff and jitter until one succeeds or the budget is
//! exhausted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::state::{ConnectionState, ConnectionStateMachine, SubscriptionId};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            // The embedding host opts in; by default a lost connection stays
            // lost until the user reconnects.
            enabled: false,
            max_attempts: 5,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

/// The dial seam the supervisor drives.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn connect(&self) -> Result<()>;
}

pub struct ReconnectSupervisor {
    state: Arc<ConnectionStateMachine>,
    handler: Arc<dyn ConnectionHandler>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    attempts_made: Arc<AtomicU32>,
    subscription: SubscriptionId,
}

impl ReconnectSupervisor {
    /// Attach to the state machine. Dropping the supervisor (or calling
    /// `shutdown`) detaches and cancels any in-flight attempt loop.
    pub fn attach(
        config: ReconnectConfig,
        state: Arc<ConnectionStateMachine>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(false));
        let attempts_made = Arc::new(AtomicU32::new(0));

        let trigger_state = Arc::clone(&state);
        let trigger_handler = Arc::clone(&handler);
        let trigger_config = config.clone();
        let trigger_cancel = cancel.clone();
        let trigger_running = Arc::clone(&running);
        let trigger_attempts = Arc::clone(&attempts_made);

        let subscription =
            state.subscribe_state(ConnectionState::Disconnected, move |record| {
                if !trigger_config.enabled || record.from != ConnectionState::Connected {
                    return;
                }
                if trigger_running.swap(true, Ordering::SeqCst) {
                    return;
                }
                debug!(
                    target: "connection::reconnect",
                    reason = %record.reason,
                    "Connection dropped, scheduling reconnect"
                );
                let state = Arc::clone(&trigger_state);
                let handler = Arc::clone(&trigger_handler);
                let config = trigger_config.clone();
                let cancel = trigger_cancel.clone();
                let running = Arc::clone(&trigger_running);
                let attempts = Arc::clone(&trigger_attempts);
                tokio::spawn(async move {
                    run_attempts(config, state, handler, cancel, attempts).await;
                    running.store(false, Ordering::SeqCst);
                });
            });

        Arc::new(ReconnectSupervisor {
            state,
            handler,
            cancel,
            running,
            attempts_made,
            subscription,
        })
    }

    pub fn is_reconnecting(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.state.unsubscribe(self.subscription);
    }

    /// Kick off an attempt loop immediately, regardless of the trigger.
    /// Used by hosts that want a manual "reconnect now" action.
    pub async fn reconnect_now(&self) -> Result<()> {
        self.handler.connect().await
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_attempts(
    config: ReconnectConfig,
    state: Arc<ConnectionStateMachine>,
    handler: Arc<dyn ConnectionHandler>,
    cancel: CancellationToken,
    attempts_made: Arc<AtomicU32>,
) {
    attempts_made.store(0, Ordering::SeqCst);
    for attempt in 0..config.max_attempts {
        if !state.try_transition(ConnectionState::Reconnecting, "reconnect") {
            // Someone else moved the machine (manual connect, shutdown).
            return;
        }
        let delay = backoff_delay(&config, attempt);
        debug!(
            target: "connection::reconnect",
            attempt = attempt + 1,
            max = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnect attempt"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return,
        }

        attempts_made.fetch_add(1, Ordering::SeqCst);
        match handler.connect().await {
            Ok(()) => {
                info!(
                    target: "connection::reconnect",
                    attempt = attempt + 1,
                    "Reconnected"
                );
                return;
            }
            Err(err) => {
                warn!(
                    target: "connection::reconnect",
                    attempt = attempt + 1,
                    error = %err,
                    "Reconnect attempt failed"
                );
            }
        }
    }
    state.try_transition(ConnectionState::Error, "reconnect exhausted");
}

/// `initial * factor^attempt` with ±10% jitter, capped at `max_delay`.
fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let base = config.initial_delay.as_millis() as f64
        * config.backoff_factor.powi(attempt.min(16) as i32);
    let capped = base.min(config.max_delay.as_millis() as f64);
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_millis((capped * jitter) as u64)
}
