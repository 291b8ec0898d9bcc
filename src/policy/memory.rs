//! In-memory policy storage.
//!
//! Volatile storage for development and testing. Records are kept as their
//! serialized form so read paths exercise the same parse-and-skip handling
//! the persistent store has.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, error};

use super::store::{index_score, parse_record, ListOptions, PolicyStore, COUNT_DISPLAY_CAP};
use super::types::{now_ts, Policy, PolicyPatch};

/// Default cap on how many active rules a listing returns.
pub const DEFAULT_CAPACITY: usize = 128;

pub struct MemoryPolicyStore {
    inner: RwLock<Inner>,
    capacity: usize,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    /// pid -> serialized record
    records: HashMap<String, Vec<u8>>,
    /// (score, pid) -> (), ordered ascending; reverse iteration is
    /// most-recent-first
    index: BTreeMap<(u64, String), ()>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        debug!(capacity, "creating in-memory policy store");
        Self {
            inner: RwLock::new(Inner::default()),
            capacity,
        }
    }

    fn write_record(inner: &mut Inner, policy: &Policy) -> Result<()> {
        let raw = serde_json::to_vec(policy).context("failed to encode policy record")?;
        inner.records.insert(policy.pid.clone(), raw);
        Ok(())
    }

    /// Insert raw bytes as a record, bypassing encoding. Lets tests plant
    /// corrupt entries the way a partial write would.
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, pid: &str, timestamp: f64, raw: &[u8]) {
        let mut inner = self.inner.write().unwrap();
        inner.records.insert(pid.to_string(), raw.to_vec());
        inner.index.insert((index_score(timestamp), pid.to_string()), ());
    }
}

impl Default for MemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn allocate_id(&self) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        inner.next_id += 1;
        Ok(inner.next_id)
    }

    async fn save(&self, policy: &mut Policy) -> Result<String> {
        let id = self.allocate_id().await?;
        policy.pid = id.to_string();
        policy.normalize();
        if policy.timestamp == 0.0 {
            policy.timestamp = now_ts();
        }

        let mut inner = self.inner.write().unwrap();
        Self::write_record(&mut inner, policy)?;
        inner
            .index
            .insert((index_score(policy.timestamp), policy.pid.clone()), ());
        Ok(policy.pid.clone())
    }

    async fn update(&self, pid: &str, patch: PolicyPatch) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let raw = match inner.records.get(pid) {
            Some(raw) => raw.clone(),
            None => bail!("policy {pid} not found"),
        };
        let mut policy = serde_json::from_slice::<Policy>(&raw)
            .with_context(|| format!("policy {pid} record is malformed"))?;
        patch.apply(&mut policy);
        Self::write_record(&mut inner, &policy)
    }

    async fn get(&self, pid: &str) -> Result<Option<Policy>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .records
            .get(pid)
            .and_then(|raw| parse_record(pid, raw)))
    }

    async fn delete(&self, pid: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.records.remove(pid) {
            Some(raw) => {
                if let Some(policy) = parse_record(pid, &raw) {
                    inner
                        .index
                        .remove(&(index_score(policy.timestamp), pid.to_string()));
                } else {
                    // corrupt record: the timestamp is unknown, scan for the entry
                    inner.index.retain(|(_, p), _| p != pid);
                }
                Ok(())
            }
            None => {
                error!(pid, "policy doesn't exist");
                Ok(())
            }
        }
    }

    async fn list_active(&self, opts: ListOptions) -> Result<Vec<Policy>> {
        let number = opts.number.unwrap_or(self.capacity);
        let inner = self.inner.read().unwrap();
        let policies = inner
            .index
            .keys()
            .rev()
            .take(number)
            .filter_map(|(_, pid)| {
                inner.records.get(pid).and_then(|raw| parse_record(pid, raw))
            })
            .filter(|p| opts.including_disabled || !p.is_disabled())
            .collect();
        Ok(policies)
    }

    async fn list_recent(&self, window_secs: u64) -> Result<Vec<Policy>> {
        let min = index_score(now_ts() - window_secs as f64);
        let inner = self.inner.read().unwrap();
        let policies = inner
            .index
            .keys()
            .rev()
            .take_while(|(score, _)| *score >= min)
            .filter_map(|(_, pid)| {
                inner.records.get(pid).and_then(|raw| parse_record(pid, raw))
            })
            .collect();
        Ok(policies)
    }

    async fn count(&self) -> Result<u64> {
        let inner = self.inner.read().unwrap();
        Ok((inner.index.len() as u64).min(COUNT_DISPLAY_CAP))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::{Patch, PolicyType};

    #[tokio::test]
    async fn test_pids_allocated_from_one() {
        let store = MemoryPolicyStore::new();

        let mut a = Policy::new(PolicyType::Mac, "aa:bb:cc:dd:ee:ff");
        let mut b = Policy::new(PolicyType::Ip, "10.0.0.1");
        assert_eq!(store.save(&mut a).await.unwrap(), "1");
        assert_eq!(store.save(&mut b).await.unwrap(), "2");

        // stored target is normalized on save
        let got = store.get("1").await.unwrap().unwrap();
        assert_eq!(got.target, "AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test]
    async fn test_save_then_get_round_trips_normalized() {
        let store = MemoryPolicyStore::new();
        let mut p = Policy::new(PolicyType::Domain, "Example.COM").with_expire(600);
        store.save(&mut p).await.unwrap();

        let got = store.get(&p.pid).await.unwrap().unwrap();
        assert_eq!(got.target, "example.com");
        assert_eq!(got.expire, Some(600));
        assert!(got.timestamp > 0.0);
    }

    #[tokio::test]
    async fn test_update_merges_without_dropping_fields() {
        let store = MemoryPolicyStore::new();
        let mut p = Policy::new(PolicyType::Ip, "10.0.0.1")
            .with_expire(600)
            .with_scope(vec!["AA:BB:CC:DD:EE:FF".into()]);
        store.save(&mut p).await.unwrap();

        store
            .update(&p.pid, PolicyPatch::disabled(true))
            .await
            .unwrap();

        let got = store.get(&p.pid).await.unwrap().unwrap();
        assert!(got.is_disabled());
        assert_eq!(got.expire, Some(600));
        assert!(got.scope.is_some());
    }

    #[tokio::test]
    async fn test_update_clear_drops_fields() {
        let store = MemoryPolicyStore::new();
        let mut p = Policy::new(PolicyType::Ip, "10.0.0.1").with_expire(600);
        p.activated_time = Some(123.0);
        store.save(&mut p).await.unwrap();

        let patch = PolicyPatch {
            expire: Patch::Clear,
            activated_time: Patch::Clear,
            ..Default::default()
        };
        store.update(&p.pid, patch).await.unwrap();

        let got = store.get(&p.pid).await.unwrap().unwrap();
        assert_eq!(got.expire, None);
        assert_eq!(got.activated_time, None);
    }

    #[tokio::test]
    async fn test_update_unknown_pid_errors() {
        let store = MemoryPolicyStore::new();
        assert!(store
            .update("999", PolicyPatch::disabled(true))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_index() {
        let store = MemoryPolicyStore::new();
        let mut p = Policy::new(PolicyType::Ip, "10.0.0.1");
        store.save(&mut p).await.unwrap();

        store.delete(&p.pid).await.unwrap();
        assert!(store.get(&p.pid).await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 0);

        // deleting again is a logged no-op
        store.delete(&p.pid).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_active_recent_first_and_disabled_filtered() {
        let store = MemoryPolicyStore::new();
        let mut old = Policy::new(PolicyType::Ip, "10.0.0.1");
        old.timestamp = now_ts() - 100.0;
        let mut newer = Policy::new(PolicyType::Ip, "10.0.0.2");
        newer.timestamp = now_ts();
        let mut off = Policy::new(PolicyType::Ip, "10.0.0.3");
        off.timestamp = now_ts() - 50.0;
        off.disabled = Some(true);

        store.save(&mut old).await.unwrap();
        store.save(&mut newer).await.unwrap();
        store.save(&mut off).await.unwrap();

        let active = store.list_active(ListOptions::default()).await.unwrap();
        assert_eq!(
            active.iter().map(|p| p.target.as_str()).collect::<Vec<_>>(),
            vec!["10.0.0.2", "10.0.0.1"]
        );

        let all = store
            .list_active(ListOptions {
                including_disabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_record_skipped_not_fatal() {
        let store = MemoryPolicyStore::new();
        let mut good = Policy::new(PolicyType::Ip, "10.0.0.1");
        store.save(&mut good).await.unwrap();
        store.insert_raw("666", now_ts() + 1.0, b"{not json");

        let active = store
            .list_active(ListOptions {
                including_disabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].pid, good.pid);
    }

    #[tokio::test]
    async fn test_count_capped_for_display() {
        let store = MemoryPolicyStore::new();
        for i in 0..25 {
            let mut p = Policy::new(PolicyType::Ip, format!("10.0.0.{i}"));
            store.save(&mut p).await.unwrap();
        }
        assert_eq!(store.count().await.unwrap(), COUNT_DISPLAY_CAP);
    }

    #[tokio::test]
    async fn test_list_recent_window() {
        let store = MemoryPolicyStore::new();
        let mut stale = Policy::new(PolicyType::Ip, "10.0.0.1");
        stale.timestamp = now_ts() - 7200.0;
        let mut fresh = Policy::new(PolicyType::Ip, "10.0.0.2");
        store.save(&mut stale).await.unwrap();
        store.save(&mut fresh).await.unwrap();

        let recent = store.list_recent(3600).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].target, "10.0.0.2");
    }
}
