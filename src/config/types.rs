use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::enforcement::{
    QueueConfig, DEFAULT_HEALTH_INTERVAL, DEFAULT_JOB_TIMEOUT, DEFAULT_QUEUE_DEPTH,
};
use crate::engine::DEFAULT_EXPIRE_LOOKAHEAD;
use crate::policy::SystemIdentity;
use crate::telemetry::TracingConfig;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub enforcement: EnforcementConfig,

    /// The appliance's own addresses; feeds the self-target guard.
    #[serde(default)]
    pub identity: SystemIdentity,

    #[serde(default)]
    pub telemetry: TracingConfig,
}

/// Policy store selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Volatile store; development and tests.
    Memory {
        #[serde(default = "default_capacity")]
        capacity: usize,
    },
    /// On-disk store surviving restarts.
    Persistent {
        path: PathBuf,
        #[serde(default = "default_capacity")]
        capacity: usize,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnforcementConfig {
    /// Jobs running longer than this are abandoned.
    #[serde(with = "humantime_serde", default = "default_job_timeout")]
    pub job_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub health_interval: Duration,

    /// Rules expiring within this window are treated as already expired.
    #[serde(with = "humantime_serde", default = "default_expire_lookahead")]
    pub expire_lookahead: Duration,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            job_timeout: default_job_timeout(),
            health_interval: default_health_interval(),
            expire_lookahead: default_expire_lookahead(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl EnforcementConfig {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            depth: self.queue_depth,
            job_timeout: self.job_timeout,
            health_interval: self.health_interval,
        }
    }
}

fn default_job_timeout() -> Duration {
    DEFAULT_JOB_TIMEOUT
}

fn default_health_interval() -> Duration {
    DEFAULT_HEALTH_INTERVAL
}

fn default_expire_lookahead() -> Duration {
    DEFAULT_EXPIRE_LOOKAHEAD
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}
