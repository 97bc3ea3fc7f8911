//! Session state, lifecycle events and the termination hook.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Buffer size for the session event broadcast channel.
/// Subscribers that fall further behind than this miss the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionState {
    /// No credential stored
    Anonymous,
    /// Credential present and outside the expiring-soon window
    Active,
    /// Credential present, inside the expiring-soon window
    ExpiringSoon,
    /// Credential present but past its expiry (or without a usable one)
    Expired,
    /// A refresh network call is in flight
    Refreshing,
    /// Ended by logout or an unrecoverable refresh failure
    Terminated,
}

impl SessionState {
    /// Whether a request made now would carry a credential the server should accept.
    pub fn is_usable(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::ExpiringSoon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum TerminationReason {
    /// Explicit sign-out
    Logout,
    /// The refresh call failed or timed out
    RefreshFailed,
    /// A freshly refreshed credential was still rejected by the server
    CredentialRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionEvent {
    /// The credential in use expires within the configured threshold.
    Expiring { seconds_remaining: i64 },
    /// A refresh settled successfully.
    Refreshed { subject: Option<String> },
    /// The session ended; sensitive state should be dropped.
    Terminated { reason: TerminationReason },
}

type TerminationCallback = Arc<dyn Fn(TerminationReason) + Send + Sync>;

/// Notifies collaborators (routing, UI) about session lifecycle changes.
///
/// Clearing the store is the coordinator's job; this only fans out.
pub struct TerminationHook {
    callbacks: Mutex<Vec<TerminationCallback>>,
    events: broadcast::Sender<SessionEvent>,
}

impl TerminationHook {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            callbacks: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn on_terminated<F>(&self, callback: F)
    where
        F: Fn(TerminationReason) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Publish an event without waiting on anyone.
    pub fn notify(&self, event: SessionEvent) {
        // No subscribers is not an error.
        if self.events.send(event).is_err() {
            debug!("Session event dropped, no subscribers");
        }
    }

    /// Run termination callbacks and publish `Terminated`.
    ///
    /// Callbacks run outside the callback lock so they may register further
    /// callbacks or call back into the session.
    pub(crate) fn fire(&self, reason: TerminationReason) {
        warn!(?reason, "Session terminated");
        let callbacks: Vec<TerminationCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(reason);
        }
        self.notify(SessionEvent::Terminated { reason });
    }
}

impl Default for TerminationHook {
    fn default() -> Self {
        Self::new()
    }
}
