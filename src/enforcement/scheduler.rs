//! Bridge to the external cron engine for recurring policies.
//!
//! Policies carrying a `cronTime` are not enforced inline; they are handed to
//! a scheduler which calls back into the engine when their window opens and
//! closes. The callbacks are injected after construction so the scheduler
//! never holds a reference to the engine type itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::policy::Policy;

/// Type-erased activation or deactivation callback.
pub type EnforcementFn =
    Arc<dyn Fn(Policy) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Callbacks the scheduler drives when a policy's window opens or closes.
#[derive(Clone)]
pub struct SchedulerHooks {
    pub activate: EnforcementFn,
    pub deactivate: EnforcementFn,
}

impl SchedulerHooks {
    pub fn new<A, AF, D, DF>(activate: A, deactivate: D) -> Self
    where
        A: Fn(Policy) -> AF + Send + Sync + 'static,
        AF: Future<Output = Result<()>> + Send + 'static,
        D: Fn(Policy) -> DF + Send + Sync + 'static,
        DF: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            activate: Arc::new(move |p| Box::pin(activate(p))),
            deactivate: Arc::new(move |p| Box::pin(deactivate(p))),
        }
    }
}

#[async_trait]
pub trait RecurringScheduler: Send + Sync {
    /// Install the engine callbacks. Must be called before any policy with a
    /// schedule is registered.
    fn bind(&self, hooks: SchedulerHooks);

    async fn register(&self, policy: &Policy) -> Result<()>;

    async fn deregister(&self, policy: &Policy) -> Result<()>;
}

pub type SharedScheduler = Arc<dyn RecurringScheduler>;
