//! Application-level keepalive with idle suppression.
//!
//! The probe task runs only while the connection is CONNECTED. Any inbound
//! frame, successful send, or explicit `record_activity` call bumps the
//! activity clock; a tick that finds recent activity skips its probe and
//! counts as success.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::state::{ConnectionState, ConnectionStateMachine};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_failures: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        KeepAliveConfig {
            ping_interval: Duration::from_secs(45),
            ping_timeout: Duration::from_secs(10),
            max_failures: 3,
        }
    }
}

/// The probe seam: something that can issue a PING round trip.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, timeout: Duration) -> Result<()>;
}

pub struct KeepAlive {
    config: KeepAliveConfig,
    /// Milliseconds since `origin`; avoids a lock on the hot path.
    last_activity_ms: AtomicU64,
    origin: Instant,
    consecutive_failures: AtomicU32,
    cancel: CancellationToken,
}

impl KeepAlive {
    pub fn new(config: KeepAliveConfig) -> Arc<Self> {
        Arc::new(KeepAlive {
            config,
            last_activity_ms: AtomicU64::new(0),
            origin: Instant::now(),
            consecutive_failures: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Bump the activity clock. `source` only feeds the trace log.
    pub fn record_activity(&self, source: &str) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
        trace!(target: "connection::keepalive", source, "Activity recorded");
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Start the probe loop. `on_lost` fires once when `max_failures`
    /// consecutive probes fail; with `auto_reconnect` off the state machine
    /// is also moved to DISCONNECTED with reason "keepalive".
    pub fn spawn(
        self: &Arc<Self>,
        pinger: Arc<dyn Pinger>,
        state: Arc<ConnectionStateMachine>,
        auto_reconnect: bool,
        on_lost: Box<dyn Fn() + Send + Sync>,
    ) -> JoinHandle<()> {
        let keepalive = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive.config.ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of tokio's interval fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(target: "connection::keepalive", "Keepalive stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                if state.current() != ConnectionState::Connected {
                    continue;
                }

                // Idle suppression: recent traffic already proves liveness.
                if keepalive.idle_for() < keepalive.config.ping_interval {
                    trace!(target: "connection::keepalive", "Probe skipped, link recently active");
                    keepalive.consecutive_failures.store(0, Ordering::Relaxed);
                    continue;
                }

                match pinger.ping(keepalive.config.ping_timeout).await {
                    Ok(()) => {
                        keepalive.record_activity("ping");
                        keepalive.consecutive_failures.store(0, Ordering::Relaxed);
                    }
                    Err(err) => {
                        let failures =
                            keepalive.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            target: "connection::keepalive",
                            failures,
                            max = keepalive.config.max_failures,
                            error = %err,
                            "Keepalive probe failed"
                        );
                        if failures >= keepalive.config.max_failures {
                            keepalive.consecutive_failures.store(0, Ordering::Relaxed);
                            on_lost();
                            if !auto_reconnect {
                                state.try_transition(
                                    ConnectionState::Disconnected,
                                    "keepalive",
                                );
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedPinger {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Pinger for ScriptedPinger {
        async fn ping(&self, _timeout: Duration) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EngineError::Timeout { elapsed_ms: 1 })
            } else {
                Ok(())
            }
        }
    }

    fn connected_machine() -> Arc<ConnectionStateMachine> {
        let machine = ConnectionStateMachine::new();
        machine.try_transition(ConnectionState::Connecting, "test");
        machine.try_transition(ConnectionState::Connected, "test");
        machine
    }

    #[tokio::test(start_paused = true)]
    async fn idle_suppression_skips_probes() {
        let keepalive = KeepAlive::new(KeepAliveConfig {
            ping_interval: Duration::from_millis(100),
            ping_timeout: Duration::from_millis(50),
            max_failures: 3,
        });
        let pinger = Arc::new(ScriptedPinger {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let state = connected_machine();
        let handle = keepalive.spawn(
            Arc::clone(&pinger) as Arc<dyn Pinger>,
            state,
            false,
            Box::new(|| {}),
        );

        // Keep recording activity just before each tick; no probe should go out.
        for _ in 0..5 {
            keepalive.record_activity("test-traffic");
            tokio::time::advance(Duration::from_millis(60)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(pinger.calls.load(Ordering::SeqCst), 0);
        keepalive.stop();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_signal_connection_lost() {
        let keepalive = KeepAlive::new(KeepAliveConfig {
            ping_interval: Duration::from_millis(100),
            ping_timeout: Duration::from_millis(50),
            max_failures: 3,
        });
        let pinger = Arc::new(ScriptedPinger {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let state = connected_machine();
        let lost = Arc::new(AtomicUsize::new(0));
        let lost_counter = Arc::clone(&lost);
        let handle = keepalive.spawn(
            Arc::clone(&pinger) as Arc<dyn Pinger>,
            Arc::clone(&state),
            false,
            Box::new(move || {
                lost_counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Let the link sit idle across enough ticks for three failed probes.
        for _ in 0..8 {
            tokio::time::advance(Duration::from_millis(110)).await;
            tokio::task::yield_now().await;
        }
        assert!(lost.load(Ordering::SeqCst) >= 1);
        assert_eq!(state.current(), ConnectionState::Disconnected);
        keepalive.stop();
        let _ = handle.await;
    }
}
