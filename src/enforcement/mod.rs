//! Turning policy records into backend effects.
//!
//! The [`Dispatcher`] translates a policy into calls on the blocking backend
//! for both activation and deactivation. Everything that mutates backend
//! state flows through the [`EnforcementQueue`]: a single worker processes
//! intents serially so no two enforcement actions race each other. The
//! [`ExpirationManager`] handles time-limited rules, and policies with a
//! cron schedule are delegated to the [`RecurringScheduler`] bridge.

mod backend;
mod dispatcher;
mod expiration;
mod mock;
mod queue;
mod scheduler;

pub use backend::{
    BlockBackend, CategoryBlocker, DomainBlockOptions, DomainBlocker, HostEntry, HostLookup,
    IpMappingOptions, PortProtocol, ALLOW_DOMAIN_SET, ALLOW_IP_PORT_SET, ALLOW_IP_SET,
    ALLOW_MAC_SET,
};
pub use dispatcher::{Dispatcher, EnforceError};
pub use expiration::ExpirationManager;
pub use mock::{
    AdvancedEntry, MockBackend, MockCategoryBlocker, MockDomainBlocker, MockScheduler,
    StaticHostLookup,
};
pub use queue::{
    EnforcementAction, EnforcementJob, EnforcementQueue, JobExecutor, QueueConfig, QueueHealth,
    DEFAULT_HEALTH_INTERVAL, DEFAULT_JOB_TIMEOUT, DEFAULT_QUEUE_DEPTH,
};
pub use scheduler::{EnforcementFn, RecurringScheduler, SchedulerHooks, SharedScheduler};
