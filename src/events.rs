//! Structured runtime events
//!
//! Every state transition, security decision, and violation is emitted as
//! a structured event. The runtime defines the event shape but not the
//! sink: observers subscribe to the broadcast channel and forward events
//! to whatever logging or metrics backend the host uses.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::registry::store::{SecurityViolation, TransitionOutcome};
use crate::security::gate::TrustTier;
use crate::traits::ModuleState;

/// Structured event emitted by the runtime
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// A module completed a state transition
    StateChanged {
        module: String,
        from: ModuleState,
        to: ModuleState,
        outcome: TransitionOutcome,
    },
    /// The security gate ruled on a module
    SecurityDecision {
        module: String,
        approved: bool,
        tier: Option<TrustTier>,
        reason: Option<String>,
    },
    /// The runtime monitor detected a violation
    Violation(SecurityViolation),
    /// A hot swap committed
    HotSwapped {
        module: String,
        old_version: String,
        new_version: String,
        with_state: bool,
    },
}

/// Broadcast bus for runtime events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to runtime events
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Fire-and-forget: a bus with no subscribers drops
    /// the event.
    pub fn publish(&self, event: RuntimeEvent) {
        debug!("Runtime event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
