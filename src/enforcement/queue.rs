//! Single-consumer queue serializing all backend mutation.
//!
//! Any number of producers submit intents; exactly one worker drains them,
//! one at a time, so no two enforcement actions ever run concurrently
//! against the backend. Jobs are transient work items, not an audit log:
//! finished jobs are dropped, outcomes live in the log stream and the
//! health counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::policy::Policy;

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementAction {
    Enforce,
    Unenforce,
    /// Deactivate the old policy then activate the new one. Used when a
    /// rule's defining fields change without changing its identity.
    Reenforce,
    /// Reconciliation pass over every tracked domain mapping. Not bounded
    /// by the per-policy job timeout.
    IncrementalUpdate,
}

impl EnforcementAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Enforce => "enforce",
            Self::Unenforce => "unenforce",
            Self::Reenforce => "reenforce",
            Self::IncrementalUpdate => "incrementalUpdate",
        }
    }
}

/// One unit of work for the enforcement worker.
#[derive(Debug, Clone)]
pub struct EnforcementJob {
    pub action: EnforcementAction,
    pub policy: Option<Policy>,
    pub old_policy: Option<Policy>,
}

impl EnforcementJob {
    pub fn enforce(policy: Policy) -> Self {
        Self {
            action: EnforcementAction::Enforce,
            policy: Some(policy),
            old_policy: None,
        }
    }

    pub fn unenforce(policy: Policy) -> Self {
        Self {
            action: EnforcementAction::Unenforce,
            policy: Some(policy),
            old_policy: None,
        }
    }

    pub fn reenforce(policy: Policy, old_policy: Policy) -> Self {
        Self {
            action: EnforcementAction::Reenforce,
            policy: Some(policy),
            old_policy: Some(old_policy),
        }
    }

    pub fn incremental_update() -> Self {
        Self {
            action: EnforcementAction::IncrementalUpdate,
            policy: None,
            old_policy: None,
        }
    }

    fn pid(&self) -> &str {
        self.policy.as_ref().map(|p| p.pid.as_str()).unwrap_or("-")
    }
}

/// What the worker runs per job. The engine implements this over the
/// dispatcher; tests substitute recorders.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: EnforcementJob) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub depth: usize,
    pub job_timeout: Duration,
    pub health_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_QUEUE_DEPTH,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

#[derive(Default)]
struct QueueStats {
    depth: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHealth {
    pub depth: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub dropped: u64,
}

impl QueueStats {
    fn snapshot(&self) -> QueueHealth {
        QueueHealth {
            depth: self.depth.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct EnforcementQueue {
    config: QueueConfig,
    tx: mpsc::Sender<EnforcementJob>,
    rx: Mutex<Option<mpsc::Receiver<EnforcementJob>>>,
    stats: Arc<QueueStats>,
}

impl EnforcementQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.depth);
        Self {
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            stats: Arc::new(QueueStats::default()),
        }
    }

    /// Enqueue a job without blocking. A full queue is an error surfaced to
    /// the caller, not a silent drop.
    pub fn submit(&self, job: EnforcementJob) -> Result<()> {
        let action = job.action.name();
        let pid = job.pid().to_string();
        match self.tx.try_send(job) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                self.stats.depth.fetch_add(1, Ordering::Relaxed);
                debug!(pid = %pid, action, "job submitted");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(pid = %pid, action, "enforcement queue full, job rejected");
                anyhow::bail!("enforcement queue full")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                anyhow::bail!("enforcement queue closed")
            }
        }
    }

    pub fn health(&self) -> QueueHealth {
        self.stats.snapshot()
    }

    /// Spawn the single worker and the periodic health probe. May be called
    /// once; a second call finds the receiver already taken.
    pub fn start(&self, executor: Arc<dyn JobExecutor>) -> Result<JoinHandle<()>> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("enforcement queue already started"))?;
        self.spawn_health_probe();
        let stats = self.stats.clone();
        let timeout = self.config.job_timeout;
        Ok(tokio::spawn(worker_loop(rx, executor, stats, timeout)))
    }

    fn spawn_health_probe(&self) {
        let stats: Weak<QueueStats> = Arc::downgrade(&self.stats);
        let interval = self.config.health_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(stats) = stats.upgrade() else { break };
                let health = stats.snapshot();
                debug!(
                    depth = health.depth,
                    submitted = health.submitted,
                    completed = health.completed,
                    failed = health.failed,
                    timed_out = health.timed_out,
                    "enforcement queue health"
                );
            }
        });
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<EnforcementJob>,
    executor: Arc<dyn JobExecutor>,
    stats: Arc<QueueStats>,
    job_timeout: Duration,
) {
    info!("enforcement worker started");
    while let Some(job) = rx.recv().await {
        stats.depth.fetch_sub(1, Ordering::Relaxed);

        // Pre-migration schedules carry a wildcard minute-and-hour cron; such
        // stale records are dropped before dispatch.
        if job
            .policy
            .as_ref()
            .map(|p| p.has_legacy_schedule())
            .unwrap_or(false)
        {
            debug!(pid = job.pid(), "dropping job with legacy schedule");
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let pid = job.pid().to_string();
        let action = job.action.name();
        let outcome = if job.action == EnforcementAction::IncrementalUpdate {
            // Reconciliation over an unbounded mapping set; exempt from the
            // per-policy timeout.
            Ok(executor.execute(job).await)
        } else {
            tokio::time::timeout(job_timeout, executor.execute(job)).await
        };

        match outcome {
            Ok(Ok(())) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
                info!(pid = %pid, action, "job completed");
            }
            Ok(Err(err)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(pid = %pid, action, error = %err, "job failed");
            }
            Err(_) => {
                stats.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(pid = %pid, action, timeout = ?job_timeout, "job timed out, abandoned");
            }
        }
    }
    info!("enforcement worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyType;
    use std::sync::atomic::AtomicBool;

    struct Recorder {
        active: AtomicBool,
        seen: Mutex<Vec<(EnforcementAction, String)>>,
        delay_pid: Option<String>,
        delay: Duration,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(false),
                seen: Mutex::new(Vec::new()),
                delay_pid: None,
                delay: Duration::ZERO,
            })
        }

        fn with_delay(pid: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(false),
                seen: Mutex::new(Vec::new()),
                delay_pid: Some(pid.to_string()),
                delay,
            })
        }

        fn seen(&self) -> Vec<(EnforcementAction, String)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobExecutor for Recorder {
        async fn execute(&self, job: EnforcementJob) -> Result<()> {
            // An abandoned job never resets the flag, so only undelayed
            // recorders can assert serial execution.
            let check_serial = self.delay_pid.is_none();
            if check_serial {
                assert!(
                    !self.active.swap(true, Ordering::SeqCst),
                    "two jobs ran concurrently"
                );
            }
            let pid = job.pid().to_string();
            if self.delay_pid.as_deref() == Some(pid.as_str()) {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().unwrap().push((job.action, pid));
            if check_serial {
                self.active.store(false, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn policy_with_pid(pid: &str) -> Policy {
        let mut p = Policy::new(PolicyType::Ip, "10.0.0.1");
        p.pid = pid.to_string();
        p
    }

    fn test_config() -> QueueConfig {
        QueueConfig {
            depth: 16,
            job_timeout: Duration::from_millis(200),
            health_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn jobs_run_serially_in_order() {
        let queue = EnforcementQueue::new(test_config());
        let recorder = Recorder::new();
        let handle = queue.start(recorder.clone()).unwrap();
        for i in 1..=5 {
            queue
                .submit(EnforcementJob::enforce(policy_with_pid(&i.to_string())))
                .unwrap();
        }
        drop(queue);
        handle.await.unwrap();
        let pids: Vec<String> = recorder.seen().into_iter().map(|(_, p)| p).collect();
        assert_eq!(pids, vec!["1", "2", "3", "4", "5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_job_does_not_block_the_next() {
        let queue = EnforcementQueue::new(test_config());
        let recorder = Recorder::with_delay("1", Duration::from_secs(600));
        let handle = queue.start(recorder.clone()).unwrap();
        queue
            .submit(EnforcementJob::enforce(policy_with_pid("1")))
            .unwrap();
        queue
            .submit(EnforcementJob::enforce(policy_with_pid("2")))
            .unwrap();
        let health_before = queue.health();
        assert_eq!(health_before.submitted, 2);
        drop(queue);
        handle.await.unwrap();
        let pids: Vec<String> = recorder.seen().into_iter().map(|(_, p)| p).collect();
        assert_eq!(pids, vec!["2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn incremental_update_is_exempt_from_timeout() {
        let queue = EnforcementQueue::new(test_config());
        // Delayed on every job since the update job carries no pid.
        let recorder = Recorder::with_delay("-", Duration::from_secs(300));
        let handle = queue.start(recorder.clone()).unwrap();
        queue.submit(EnforcementJob::incremental_update()).unwrap();
        drop(queue);
        handle.await.unwrap();
        assert_eq!(
            recorder.seen(),
            vec![(EnforcementAction::IncrementalUpdate, "-".to_string())]
        );
    }

    #[tokio::test]
    async fn legacy_schedule_jobs_are_dropped() {
        let queue = EnforcementQueue::new(test_config());
        let recorder = Recorder::new();
        let handle = queue.start(recorder.clone()).unwrap();
        let mut legacy = policy_with_pid("1");
        legacy.cron_time = Some("* * 1 2 3".to_string());
        queue.submit(EnforcementJob::enforce(legacy)).unwrap();
        queue
            .submit(EnforcementJob::enforce(policy_with_pid("2")))
            .unwrap();
        drop(queue);
        handle.await.unwrap();
        let pids: Vec<String> = recorder.seen().into_iter().map(|(_, p)| p).collect();
        assert_eq!(pids, vec!["2"]);
        assert!(recorder
            .seen()
            .iter()
            .all(|(_, p)| p != "1"));
    }

    #[tokio::test]
    async fn full_queue_rejects_submission() {
        let queue = EnforcementQueue::new(QueueConfig {
            depth: 1,
            ..test_config()
        });
        queue
            .submit(EnforcementJob::enforce(policy_with_pid("1")))
            .unwrap();
        let err = queue
            .submit(EnforcementJob::enforce(policy_with_pid("2")))
            .unwrap_err();
        assert!(err.to_string().contains("full"));
    }

    #[tokio::test]
    async fn queue_starts_only_once() {
        let queue = EnforcementQueue::new(test_config());
        let recorder = Recorder::new();
        let _handle = queue.start(recorder.clone()).unwrap();
        assert!(queue.start(recorder).is_err());
    }
}
