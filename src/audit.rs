//! Audit trail for policy lifecycle actions.
//!
//! Every block/unblock/enable/disable is reported to a sink for analytics
//! and abuse review. Submission is strictly best effort: a sink failure is
//! logged and the lifecycle operation proceeds.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::policy::{now_ts, Policy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Block,
    Unblock,
    Enable,
    Disable,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub pid: String,
    #[serde(rename = "type")]
    pub ptype: String,
    pub target: String,
    pub timestamp: f64,
}

impl AuditEvent {
    pub fn new(action: AuditAction, policy: &Policy) -> Self {
        Self {
            action,
            pid: policy.pid.clone(),
            ptype: policy.ptype.name().to_string(),
            target: policy.target.clone(),
            timestamp: now_ts(),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

/// Sink that writes events to the log stream. The default for deployments
/// without an external collector.
#[derive(Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        info!(
            action = ?event.action,
            pid = %event.pid,
            ptype = %event.ptype,
            target = %event.target,
            "policy audit"
        );
        Ok(())
    }
}

/// Collecting sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn actions_for(&self, pid: &str) -> Vec<AuditAction> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.pid == pid)
            .map(|e| e.action)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Submit an event, swallowing sink failures.
pub async fn submit(sink: &dyn AuditSink, event: AuditEvent) {
    let action = event.action;
    let pid = event.pid.clone();
    if let Err(err) = sink.record(event).await {
        warn!(action = ?action, pid = %pid, error = %err, "audit submission failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyType;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _event: AuditEvent) -> Result<()> {
            anyhow::bail!("collector unreachable")
        }
    }

    #[tokio::test]
    async fn memory_sink_collects_events() {
        let sink = MemoryAuditSink::new();
        let mut policy = Policy::new(PolicyType::Domain, "ads.example.com");
        policy.pid = "3".into();
        submit(&sink, AuditEvent::new(AuditAction::Block, &policy)).await;
        submit(&sink, AuditEvent::new(AuditAction::Unblock, &policy)).await;
        assert_eq!(
            sink.actions_for("3"),
            vec![AuditAction::Block, AuditAction::Unblock]
        );
    }

    #[tokio::test]
    async fn sink_failure_is_swallowed() {
        let policy = Policy::new(PolicyType::Ip, "10.0.0.1");
        submit(&FailingSink, AuditEvent::new(AuditAction::Block, &policy)).await;
    }
}
