//! Policy lifecycle orchestration.
//!
//! [`PolicyEngine`] is an explicitly constructed instance owning the store
//! handle, the job queue and the process-local timer map. Components that
//! need it receive a handle; there is no ambient global. One process runs
//! the engine with the queue worker (the executor role); everything else
//! requests actions through the event bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditAction, AuditEvent, AuditSink};
use crate::enforcement::{
    BlockBackend, CategoryBlocker, Dispatcher, DomainBlocker, EnforceError, EnforcementAction,
    EnforcementJob, EnforcementQueue, ExpirationManager, HostLookup, JobExecutor, QueueConfig,
    QueueHealth, SchedulerHooks, SharedScheduler,
};
use crate::events::{
    EnforcementRequester, PolicyAction, PolicyEvent, PolicyEventBus, EXECUTOR_PROCESS,
};
use crate::policy::{
    find_duplicates, now_ts, ListOptions, Patch, Policy, PolicyPatch, PolicyType, SafetyGuard,
    SharedPolicyStore, SystemIdentity,
};

pub const DEFAULT_EXPIRE_LOOKAHEAD: Duration = Duration::from_secs(5);

/// Result of [`PolicyEngine::check_and_save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Created { pid: String },
    /// An identical rule is already active; no new record was written.
    Duplicated { pid: String },
    /// An identical but disabled rule existed and was re-enabled.
    DuplicatedAndEnabled { pid: String },
}

impl SaveOutcome {
    pub fn pid(&self) -> &str {
        match self {
            Self::Created { pid }
            | Self::Duplicated { pid }
            | Self::DuplicatedAndEnabled { pid } => pid,
        }
    }
}

/// Everything the engine is wired with, injected at construction.
pub struct EngineParts {
    pub store: SharedPolicyStore,
    pub backend: Arc<dyn BlockBackend>,
    pub domains: Arc<dyn DomainBlocker>,
    pub categories: Arc<dyn CategoryBlocker>,
    pub hosts: Arc<dyn HostLookup>,
    pub scheduler: SharedScheduler,
    pub audit: Arc<dyn AuditSink>,
    pub bus: Arc<PolicyEventBus>,
    pub identity: SystemIdentity,
    pub queue_config: QueueConfig,
    pub expire_lookahead: Duration,
}

pub struct PolicyEngine {
    store: SharedPolicyStore,
    dispatcher: Arc<Dispatcher>,
    expiration: Arc<ExpirationManager>,
    scheduler: SharedScheduler,
    audit: Arc<dyn AuditSink>,
    bus: Arc<PolicyEventBus>,
    requester: EnforcementRequester,
    queue: EnforcementQueue,
    guard: SafetyGuard,
    expire_lookahead: Duration,
}

impl PolicyEngine {
    pub fn new(parts: EngineParts) -> Arc<Self> {
        let guard = SafetyGuard::new(parts.identity);
        let dispatcher = Arc::new(Dispatcher::new(
            parts.store.clone(),
            parts.backend,
            parts.domains,
            parts.categories,
            parts.hosts,
            guard.clone(),
        ));
        Arc::new(Self {
            store: parts.store,
            dispatcher,
            expiration: Arc::new(ExpirationManager::new()),
            scheduler: parts.scheduler,
            audit: parts.audit,
            requester: EnforcementRequester::new(parts.bus.clone()),
            bus: parts.bus,
            queue: EnforcementQueue::new(parts.queue_config),
            guard,
            expire_lookahead: parts.expire_lookahead,
        })
    }

    /// A publish-only handle for components that request enforcement but
    /// must not execute it.
    pub fn requester(&self) -> EnforcementRequester {
        self.requester.clone()
    }

    pub fn queue_health(&self) -> QueueHealth {
        self.queue.health()
    }

    /// Wire the scheduler callbacks, start the queue worker and subscribe
    /// the event listener. Call once, in the process that owns enforcement.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let dispatcher = self.dispatcher.clone();
        let activate = move |policy: Policy| {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher.activate(&policy).await?;
                Ok(())
            }
        };
        let dispatcher = self.dispatcher.clone();
        let deactivate = move |policy: Policy| {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher.deactivate(&policy).await?;
                Ok(())
            }
        };
        self.scheduler.bind(SchedulerHooks::new(activate, deactivate));

        self.queue
            .start(self.clone() as Arc<dyn JobExecutor>)
            .context("starting enforcement queue")?;

        let engine = self.clone();
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => engine.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event listener lagged, events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        info!("policy engine started");
        Ok(())
    }

    fn handle_event(&self, event: PolicyEvent) {
        if event.to_process != EXECUTOR_PROCESS {
            return;
        }
        let job = match event.action {
            PolicyAction::Enforce => event.policy.map(EnforcementJob::enforce),
            PolicyAction::Unenforce => event.policy.map(EnforcementJob::unenforce),
            PolicyAction::Reenforce => match (event.policy, event.old_policy) {
                (Some(policy), Some(old)) => Some(EnforcementJob::reenforce(policy, old)),
                // Without the old rule there is nothing to take down first.
                (Some(policy), None) => Some(EnforcementJob::enforce(policy)),
                _ => None,
            },
            PolicyAction::IncrementalUpdate => Some(EnforcementJob::incremental_update()),
        };
        match job {
            Some(job) => {
                if let Err(err) = self.queue.submit(job) {
                    warn!(error = %err, "failed to enqueue enforcement request");
                }
            }
            None => debug!("ignoring event without policy payload"),
        }
    }

    /// Deduplicating save: normalization, safety check, duplicate lookup,
    /// then persistence and an asynchronous enforce request. The duplicate
    /// lookup and the write are not isolated against concurrent writers in
    /// other processes.
    pub async fn check_and_save(&self, mut policy: Policy) -> Result<SaveOutcome> {
        policy.normalize();
        if self.guard.is_self_target(&policy) {
            anyhow::bail!("policy targets the system itself: {}", policy.target);
        }

        let all = self
            .store
            .list_active(ListOptions {
                number: None,
                including_disabled: true,
            })
            .await?;
        let duplicates = find_duplicates(&policy, &all);

        if let Some(disabled) = duplicates.iter().find(|p| p.is_disabled()) {
            let pid = disabled.pid.clone();
            info!(pid = %pid, "duplicate rule found disabled, re-enabling");
            self.enable_policy(&pid).await?;
            return Ok(SaveOutcome::DuplicatedAndEnabled { pid });
        }
        if let Some(active) = duplicates.first() {
            info!(pid = %active.pid, "duplicate rule already active");
            return Ok(SaveOutcome::Duplicated {
                pid: active.pid.clone(),
            });
        }

        let pid = self.save_policy(&mut policy).await?;
        Ok(SaveOutcome::Created { pid })
    }

    /// Persist a new policy and request its enforcement.
    pub async fn save_policy(&self, policy: &mut Policy) -> Result<String> {
        let pid = self.store.save(policy).await?;
        audit::submit(&*self.audit, AuditEvent::new(AuditAction::Block, policy)).await;
        self.requester.request_enforce(policy.clone());
        info!(pid = %pid, ptype = policy.ptype.name(), target = %policy.target, "policy saved");
        Ok(pid)
    }

    pub async fn get_policy(&self, pid: &str) -> Result<Option<Policy>> {
        self.store.get(pid).await
    }

    pub async fn list_policies(&self, options: ListOptions) -> Result<Vec<Policy>> {
        self.store.list_active(options).await
    }

    /// First active rule matching a type and (normalized) target.
    pub async fn find_policy(&self, ptype: PolicyType, target: &str) -> Result<Option<Policy>> {
        let mut wanted = Policy::new(ptype, target);
        wanted.normalize();
        let all = self
            .store
            .list_active(ListOptions {
                number: None,
                including_disabled: true,
            })
            .await?;
        Ok(all
            .into_iter()
            .find(|p| p.ptype == wanted.ptype && p.target == wanted.target))
    }

    /// Re-enable a disabled rule, keeping an existing activation stamp.
    pub async fn enable_policy(&self, pid: &str) -> Result<()> {
        let policy = self
            .store
            .get(pid)
            .await?
            .with_context(|| format!("no such policy: {pid}"))?;
        if !policy.is_disabled() {
            debug!(pid, "policy already enabled");
            return Ok(());
        }
        let mut patch = PolicyPatch::disabled(false);
        if policy.activated_time.is_none() {
            patch.activated_time = Patch::Set(now_ts());
        }
        self.store.update(pid, patch).await?;
        let enabled = self
            .store
            .get(pid)
            .await?
            .with_context(|| format!("policy vanished during enable: {pid}"))?;
        audit::submit(&*self.audit, AuditEvent::new(AuditAction::Enable, &enabled)).await;
        self.requester.request_enforce(enabled);
        Ok(())
    }

    pub async fn disable_policy(&self, pid: &str) -> Result<()> {
        let policy = self
            .store
            .get(pid)
            .await?
            .with_context(|| format!("no such policy: {pid}"))?;
        if policy.is_disabled() {
            debug!(pid, "policy already disabled");
            return Ok(());
        }
        self.store.update(pid, PolicyPatch::disabled(true)).await?;
        audit::submit(&*self.audit, AuditEvent::new(AuditAction::Disable, &policy)).await;
        self.requester.request_unenforce(policy);
        Ok(())
    }

    /// Tag a rule for later cleanup without disturbing its enforcement
    /// state. Unknown pids are ignored.
    pub async fn mark_as_should_delete(&self, pid: &str) -> Result<()> {
        if self.store.get(pid).await?.is_none() {
            debug!(pid, "mark-for-deletion on unknown policy");
            return Ok(());
        }
        let patch = PolicyPatch {
            should_delete: Some(true),
            ..Default::default()
        };
        self.store.update(pid, patch).await
    }

    /// Remove a rule entirely. The record is deleted first so a crash
    /// between the two steps leaves at worst a stale backend entry, never a
    /// resurrected rule.
    pub async fn disable_and_delete_policy(&self, pid: &str) -> Result<()> {
        let Some(policy) = self.store.get(pid).await? else {
            warn!(pid, "delete requested for unknown policy");
            return Ok(());
        };
        self.store.delete(pid).await?;
        audit::submit(&*self.audit, AuditEvent::new(AuditAction::Unblock, &policy)).await;
        self.requester.request_unenforce(policy);
        Ok(())
    }

    /// Prune a removed device from every rule that scopes it. Rules scoped
    /// to that device alone are deleted and un-enforced; rules covering
    /// other devices too keep running with the device removed, re-enforced
    /// against their old shape.
    pub async fn delete_mac_related_policies(&self, mac: &str) -> Result<()> {
        let mac = mac.to_uppercase();
        let rules = self
            .store
            .list_active(ListOptions {
                number: None,
                including_disabled: true,
            })
            .await?;

        for rule in rules {
            let Some(scope) = rule.scope.as_ref() else {
                continue;
            };
            if !scope.iter().any(|m| m.eq_ignore_ascii_case(&mac)) {
                continue;
            }
            if scope.len() <= 1 {
                info!(pid = %rule.pid, mac = %mac, "removing rule scoped only to deleted device");
                self.disable_and_delete_policy(&rule.pid).await?;
            } else {
                let reduced: Vec<String> = scope
                    .iter()
                    .filter(|m| !m.eq_ignore_ascii_case(&mac))
                    .cloned()
                    .collect();
                let patch = PolicyPatch {
                    scope: Patch::Set(reduced),
                    ..Default::default()
                };
                self.store.update(&rule.pid, patch).await?;
                let updated = self
                    .store
                    .get(&rule.pid)
                    .await?
                    .with_context(|| format!("policy vanished during scope update: {}", rule.pid))?;
                info!(pid = %rule.pid, mac = %mac, "removed device from rule scope");
                self.requester.request_reenforce(updated, rule);
            }
        }
        Ok(())
    }

    /// Startup pass: enqueue an enforce job for every active policy. One
    /// policy's failure never aborts the rest.
    pub async fn enforce_all_policies(&self) -> Result<usize> {
        let rules = self
            .store
            .list_active(ListOptions {
                number: None,
                including_disabled: false,
            })
            .await?;
        let mut enqueued = 0;
        for rule in rules {
            match self.queue.submit(EnforcementJob::enforce(rule)) {
                Ok(()) => enqueued += 1,
                Err(err) => warn!(error = %err, "failed to enqueue startup enforcement"),
            }
        }
        info!(enqueued, "startup enforcement pass queued");
        Ok(enqueued)
    }

    /// Activation branching: recurring rules go to the scheduler,
    /// time-limited rules through the expiration path, everything else
    /// straight to the dispatcher.
    pub async fn enforce(&self, policy: &Policy) -> Result<(), EnforceError> {
        if policy.is_disabled() {
            debug!(pid = %policy.pid, "policy disabled, not enforcing");
            return Ok(());
        }
        // Expiry takes precedence over a cron schedule when a rule carries
        // both fields.
        if policy.expire.is_some() {
            return self.enforce_with_expiry(policy).await;
        }
        if policy.is_recurring() {
            return self
                .scheduler
                .register(policy)
                .await
                .map_err(|source| EnforceError::Backend {
                    pid: policy.pid.clone(),
                    source,
                });
        }
        self.dispatcher.activate(policy).await
    }

    /// Deactivation branching, mirroring [`enforce`](Self::enforce). Any
    /// pending expiry timer is cancelled first so it cannot fire after a
    /// manual takedown.
    pub async fn unenforce(&self, policy: &Policy) -> Result<(), EnforceError> {
        self.expiration.cancel(&policy.pid);
        if policy.is_recurring() && policy.expire.is_none() {
            return self
                .scheduler
                .deregister(policy)
                .await
                .map_err(|source| EnforceError::Backend {
                    pid: policy.pid.clone(),
                    source,
                });
        }
        self.dispatcher.deactivate(policy).await
    }

    async fn enforce_with_expiry(&self, policy: &Policy) -> Result<(), EnforceError> {
        let now = now_ts();
        if policy.will_expire_soon(now, self.expire_lookahead) {
            // Expired or about to: never touches the backend, just a
            // deferred transition to disabled.
            info!(pid = %policy.pid, "policy expired, skipping activation");
            let residual = policy.expire_residual(now);
            self.arm_expiry(&policy.pid, residual, false);
            return Ok(());
        }

        self.dispatcher.activate(policy).await?;

        // The dispatcher may have stamped a fresh activation time; the
        // residual is computed from what was actually persisted.
        let stored = self
            .store
            .get(&policy.pid)
            .await
            .map_err(|source| EnforceError::Store {
                pid: policy.pid.clone(),
                source,
            })?
            .unwrap_or_else(|| policy.clone());
        let residual = stored.expire_residual(now_ts());
        self.arm_expiry(&policy.pid, residual, true);
        Ok(())
    }

    fn arm_expiry(&self, pid: &str, residual: Duration, deactivate: bool) {
        let store = self.store.clone();
        let dispatcher = self.dispatcher.clone();
        let audit = self.audit.clone();
        let task_pid = pid.to_string();
        self.expiration.arm(pid, residual, async move {
            // The stored record is the source of truth; an out-of-band
            // disable or delete means there is nothing left to do.
            let policy = match store.get(&task_pid).await {
                Ok(Some(p)) if !p.is_disabled() => p,
                Ok(_) => return,
                Err(err) => {
                    warn!(pid = %task_pid, error = %err, "expiry read-back failed");
                    return;
                }
            };
            info!(pid = %task_pid, "policy expired");
            if deactivate {
                if let Err(err) = dispatcher.deactivate(&policy).await {
                    warn!(pid = %task_pid, error = %err, "expiry deactivation failed");
                }
            }
            if policy.auto_delete_when_expires {
                if let Err(err) = store.delete(&task_pid).await {
                    warn!(pid = %task_pid, error = %err, "expiry deletion failed");
                }
                audit::submit(&*audit, AuditEvent::new(AuditAction::Unblock, &policy)).await;
            } else if let Err(err) = store.update(&task_pid, PolicyPatch::disabled(true)).await {
                warn!(pid = %task_pid, error = %err, "expiry disable failed");
            }
        });
    }
}

#[async_trait]
impl JobExecutor for PolicyEngine {
    async fn execute(&self, job: EnforcementJob) -> Result<()> {
        match job.action {
            EnforcementAction::Enforce => {
                let policy = job.policy.context("enforce job without policy")?;
                self.enforce(&policy).await?;
            }
            EnforcementAction::Unenforce => {
                let policy = job.policy.context("unenforce job without policy")?;
                self.unenforce(&policy).await?;
            }
            EnforcementAction::Reenforce => {
                let policy = job.policy.context("reenforce job without policy")?;
                if let Some(old) = job.old_policy {
                    self.unenforce(&old).await?;
                }
                self.enforce(&policy).await?;
            }
            EnforcementAction::IncrementalUpdate => {
                self.dispatcher.incremental_update().await?;
            }
        }
        Ok(())
    }
}
