//! Cross-process enforcement trigger.
//!
//! Any component may request an enforcement action; only the owning process
//! executes it. Requests travel as events on a broadcast bus: producers hold
//! an [`EnforcementRequester`] (publish-only capability), and exactly one
//! listener in the owning process converts events addressed to it into
//! queue jobs. Delivery is at-least-once within the target process; ordering
//! across distinct events is not guaranteed.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::policy::Policy;

pub const EXECUTOR_PROCESS: &str = "enforcer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Enforce,
    Unenforce,
    Reenforce,
    IncrementalUpdate,
}

/// An enforcement intent addressed to a specific process.
#[derive(Debug, Clone)]
pub struct PolicyEvent {
    pub action: PolicyAction,
    pub policy: Option<Policy>,
    pub old_policy: Option<Policy>,
    /// Name of the process expected to act on this event. Listeners ignore
    /// events addressed elsewhere.
    pub to_process: String,
}

/// Broadcast bus carrying [`PolicyEvent`]s between components and processes.
pub struct PolicyEventBus {
    tx: broadcast::Sender<PolicyEvent>,
}

impl PolicyEventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    pub fn publish(&self, event: PolicyEvent) {
        debug!(action = ?event.action, to = %event.to_process, "publishing policy event");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PolicyEventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

/// Publish-only handle for components that request enforcement but must
/// never execute it themselves.
#[derive(Clone)]
pub struct EnforcementRequester {
    bus: Arc<PolicyEventBus>,
    to_process: String,
}

impl EnforcementRequester {
    pub fn new(bus: Arc<PolicyEventBus>) -> Self {
        Self {
            bus,
            to_process: EXECUTOR_PROCESS.to_string(),
        }
    }

    pub fn with_target(bus: Arc<PolicyEventBus>, to_process: impl Into<String>) -> Self {
        Self {
            bus,
            to_process: to_process.into(),
        }
    }

    pub fn request_enforce(&self, policy: Policy) {
        self.publish(PolicyAction::Enforce, Some(policy), None);
    }

    pub fn request_unenforce(&self, policy: Policy) {
        self.publish(PolicyAction::Unenforce, Some(policy), None);
    }

    pub fn request_reenforce(&self, policy: Policy, old_policy: Policy) {
        self.publish(PolicyAction::Reenforce, Some(policy), Some(old_policy));
    }

    pub fn request_incremental_update(&self) {
        self.publish(PolicyAction::IncrementalUpdate, None, None);
    }

    fn publish(&self, action: PolicyAction, policy: Option<Policy>, old_policy: Option<Policy>) {
        self.bus.publish(PolicyEvent {
            action,
            policy,
            old_policy,
            to_process: self.to_process.clone(),
        });
    }
}
