//! Deferred expiry tasks for time-limited policies.
//!
//! Timers live only in this process; nothing here is persisted. A restart
//! loses pending expirations, which the startup re-enforcement pass is
//! expected to reconcile.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

/// Tracks at most one pending deferred task per policy id.
#[derive(Default)]
pub struct ExpirationManager {
    timers: Mutex<HashMap<String, AbortHandle>>,
}

impl ExpirationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` to run after `delay`. Re-arming the same pid cancels
    /// the previous timer first, so at most one deferred task ever fires per
    /// activation.
    pub fn arm<F>(self: &Arc<Self>, pid: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let manager = self.clone();
        let task_pid = pid.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.timers.lock().unwrap().remove(&task_pid);
            task.await;
        });
        let mut timers = self.timers.lock().unwrap();
        if let Some(prev) = timers.insert(pid.to_string(), handle.abort_handle()) {
            debug!(pid, "re-armed expiration timer");
            prev.abort();
        } else {
            debug!(pid, delay = ?delay, "armed expiration timer");
        }
    }

    /// Cancel a pending timer, if any. Called on manual un-enforcement so a
    /// stale timer cannot fire after the rule was already taken down.
    pub fn cancel(&self, pid: &str) {
        if let Some(handle) = self.timers.lock().unwrap().remove(pid) {
            debug!(pid, "cancelled expiration timer");
            handle.abort();
        }
    }

    pub fn cancel_all(&self) {
        let mut timers = self.timers.lock().unwrap();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    pub fn is_armed(&self, pid: &str) -> bool {
        self.timers.lock().unwrap().contains_key(pid)
    }
}
