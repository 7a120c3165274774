//! Connection lifecycle state machine.
//!
//! Five states with a fixed transition table. Every applied transition is
//! recorded in a bounded history and fanned out to subscribers in
//! registration order; transitioning into the current state is a successful
//! no-op that emits nothing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// How many transition records the history retains.
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied transition.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Token returned by `subscribe`; pass it to `unsubscribe` to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&TransitionRecord) + Send + Sync>;

struct Subscriber {
    id: u64,
    /// `None` subscribes to every transition; `Some(state)` only to
    /// transitions entering that state.
    filter: Option<ConnectionState>,
    callback: Callback,
}

struct Inner {
    current: ConnectionState,
    history: VecDeque<TransitionRecord>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

pub struct ConnectionStateMachine {
    inner: Mutex<Inner>,
}

impl ConnectionStateMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(ConnectionStateMachine {
            inner: Mutex::new(Inner {
                current: ConnectionState::Disconnected,
                history: VecDeque::with_capacity(HISTORY_LIMIT),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            }),
        })
    }

    pub fn current(&self) -> ConnectionState {
        self.inner.lock().expect("state lock").current
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectionState::Connected
    }

    /// Apply a transition if the table allows it.
    ///
    /// Returns `true` when the transition was applied or was a same-state
    /// no-op, `false` when the table rejects it (state unchanged).
    pub fn try_transition(&self, to: ConnectionState, reason: &str) -> bool {
        let (record, callbacks) = {
            let mut inner = self.inner.lock().expect("state lock");
            let from = inner.current;
            if from == to {
                return true;
            }
            if !transition_allowed(from, to) {
                warn!(
                    target: "connection::state",
                    from = from.as_str(),
                    to = to.as_str(),
                    reason,
                    "Rejected state transition"
                );
                return false;
            }

            let record = TransitionRecord {
                from,
                to,
                reason: reason.to_owned(),
                timestamp: Utc::now(),
            };
            inner.current = to;
            if inner.history.len() == HISTORY_LIMIT {
                inner.history.pop_front();
            }
            inner.history.push_back(record.clone());

            // Snapshot matching callbacks so none run under the lock.
            let callbacks: Vec<Callback> = inner
                .subscribers
                .iter()
                .filter(|s| s.filter.is_none() || s.filter == Some(to))
                .map(|s| Arc::clone(&s.callback))
                .collect();
            (record, callbacks)
        };

        debug!(
            target: "connection::state",
            from = record.from.as_str(),
            to = record.to.as_str(),
            reason = %record.reason,
            "State transition"
        );
        for callback in callbacks {
            callback(&record);
        }
        true
    }

    /// Subscribe to every transition. Callbacks run in registration order.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TransitionRecord) + Send + Sync + 'static,
    {
        self.add_subscriber(None, Arc::new(callback))
    }

    /// Subscribe to transitions entering one specific state.
    pub fn subscribe_state<F>(&self, state: ConnectionState, callback: F) -> SubscriptionId
    where
        F: Fn(&TransitionRecord) + Send + Sync + 'static,
    {
        self.add_subscriber(Some(state), Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().expect("state lock");
        inner.subscribers.retain(|s| s.id != id.0);
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner
            .lock()
            .expect("state lock")
            .history
            .iter()
            .cloned()
            .collect()
    }

    fn add_subscriber(&self, filter: Option<ConnectionState>, callback: Callback) -> SubscriptionId {
        let mut inner = self.inner.lock().expect("state lock");
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            filter,
            callback,
        });
        SubscriptionId(id)
    }
}

/// The transition table. Anything not listed is rejected.
pub fn transition_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connecting, Error)
            | (Connected, Reconnecting)
            | (Connected, Disconnected)
            | (Connected, Error)
            | (Reconnecting, Connected)
            | (Reconnecting, Error)
            | (Reconnecting, Disconnected)
            | (Error, Disconnected)
            | (Error, Connecting)
            | (Error, Reconnecting)
    )
}
