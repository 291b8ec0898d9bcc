//! Persistent policy storage using fjall (pure Rust LSM-tree).
//!
//! Durable storage for production use: policy records, the active index and
//! the id counter all survive restarts. The index partition keys records by
//! big-endian score so reverse iteration yields most-recent-first.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{error, info};

use super::store::{index_score, parse_record, ListOptions, PolicyStore, COUNT_DISPLAY_CAP};
use super::types::{now_ts, Policy, PolicyPatch};

const ID_COUNTER_KEY: &[u8] = b"policy:id";

pub struct PersistentPolicyStore {
    #[allow(dead_code)]
    keyspace: Keyspace,
    policies: PartitionHandle,
    active_index: PartitionHandle,
    metadata: PartitionHandle,
    /// Serializes read-modify-write of the id counter and of records.
    write_lock: Mutex<()>,
    capacity: usize,
}

impl PersistentPolicyStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let keyspace = fjall::Config::new(path).open()?;
        let policies = keyspace.open_partition("policies", PartitionCreateOptions::default())?;
        let active_index =
            keyspace.open_partition("active_index", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        let store = Self {
            keyspace,
            policies,
            active_index,
            metadata,
            write_lock: Mutex::new(()),
            capacity,
        };

        info!(
            path = %path.display(),
            next_id = store.peek_counter()?,
            "persistent policy store opened"
        );

        Ok(store)
    }

    fn peek_counter(&self) -> Result<u64> {
        Ok(match self.metadata.get(ID_COUNTER_KEY)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_ref()
                    .try_into()
                    .context("corrupt id counter value")?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        })
    }

    fn index_key(timestamp: f64, pid: &str) -> Vec<u8> {
        let mut key = index_score(timestamp).to_be_bytes().to_vec();
        key.extend_from_slice(pid.as_bytes());
        key
    }

    fn put_record(&self, policy: &Policy) -> Result<()> {
        let raw = serde_json::to_vec(policy).context("failed to encode policy record")?;
        self.policies.insert(policy.pid.as_bytes(), &raw)?;
        Ok(())
    }

    fn collect(
        &self,
        number: usize,
        filter_disabled: bool,
        min_score: Option<u64>,
    ) -> Result<Vec<Policy>> {
        let mut out = Vec::new();
        for item in self.active_index.iter().rev() {
            let (key, pid_raw) = item?;
            if let Some(min) = min_score {
                let score_bytes: [u8; 8] = key[..8].try_into().context("short index key")?;
                if u64::from_be_bytes(score_bytes) < min {
                    break;
                }
            }
            if out.len() >= number {
                break;
            }
            let pid = String::from_utf8_lossy(&pid_raw).to_string();
            let Some(raw) = self.policies.get(pid.as_bytes())? else {
                error!(pid, "active index entry without a record");
                continue;
            };
            if let Some(policy) = parse_record(&pid, &raw) {
                if filter_disabled && policy.is_disabled() {
                    continue;
                }
                out.push(policy);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl PolicyStore for PersistentPolicyStore {
    async fn allocate_id(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().unwrap();
        let next = self.peek_counter()? + 1;
        self.metadata.insert(ID_COUNTER_KEY, next.to_be_bytes().to_vec())?;
        Ok(next)
    }

    async fn save(&self, policy: &mut Policy) -> Result<String> {
        let id = self.allocate_id().await?;
        policy.pid = id.to_string();
        policy.normalize();
        if policy.timestamp == 0.0 {
            policy.timestamp = now_ts();
        }

        self.put_record(policy)?;
        self.active_index.insert(
            Self::index_key(policy.timestamp, &policy.pid),
            policy.pid.as_bytes(),
        )?;
        Ok(policy.pid.clone())
    }

    async fn update(&self, pid: &str, patch: PolicyPatch) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(raw) = self.policies.get(pid.as_bytes())? else {
            bail!("policy {pid} not found");
        };
        let mut policy = serde_json::from_slice::<Policy>(&raw)
            .with_context(|| format!("policy {pid} record is malformed"))?;
        patch.apply(&mut policy);
        self.put_record(&policy)
    }

    async fn get(&self, pid: &str) -> Result<Option<Policy>> {
        Ok(self
            .policies
            .get(pid.as_bytes())?
            .and_then(|raw| parse_record(pid, &raw)))
    }

    async fn delete(&self, pid: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(raw) = self.policies.get(pid.as_bytes())? else {
            error!(pid, "policy doesn't exist");
            return Ok(());
        };

        // record and index entry go in one batch so neither survives alone
        let mut batch = self.keyspace.batch();
        batch.remove(&self.policies, pid.as_bytes());
        match parse_record(pid, &raw) {
            Some(policy) => {
                batch.remove(&self.active_index, Self::index_key(policy.timestamp, pid));
            }
            None => {
                // corrupt record: scan the index for the dangling entry
                for item in self.active_index.iter() {
                    let (key, pid_raw) = item?;
                    if pid_raw.as_ref() == pid.as_bytes() {
                        batch.remove(&self.active_index, key);
                    }
                }
            }
        }
        batch.commit()?;
        Ok(())
    }

    async fn list_active(&self, opts: ListOptions) -> Result<Vec<Policy>> {
        let number = opts.number.unwrap_or(self.capacity);
        self.collect(number, !opts.including_disabled, None)
    }

    async fn list_recent(&self, window_secs: u64) -> Result<Vec<Policy>> {
        let min = index_score(now_ts() - window_secs as f64);
        self.collect(usize::MAX, false, Some(min))
    }

    async fn count(&self) -> Result<u64> {
        let mut n = 0u64;
        for item in self.active_index.iter() {
            item?;
            n += 1;
            if n >= COUNT_DISPLAY_CAP {
                break;
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::PolicyType;

    fn open_store(dir: &Path) -> PersistentPolicyStore {
        PersistentPolicyStore::open(dir, 128).unwrap()
    }

    #[tokio::test]
    async fn test_save_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut p = Policy::new(PolicyType::Mac, "aa:bb:cc:dd:ee:ff").with_expire(600);
        let pid = store.save(&mut p).await.unwrap();
        assert_eq!(pid, "1");

        let got = store.get(&pid).await.unwrap().unwrap();
        assert_eq!(got.target, "AA:BB:CC:DD:EE:FF");
        assert_eq!(got.expire, Some(600));
    }

    #[tokio::test]
    async fn test_counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            let mut p = Policy::new(PolicyType::Ip, "10.0.0.1");
            store.save(&mut p).await.unwrap();
            let mut p = Policy::new(PolicyType::Ip, "10.0.0.2");
            store.save(&mut p).await.unwrap();
        }

        let store = open_store(dir.path());
        let mut p = Policy::new(PolicyType::Ip, "10.0.0.3");
        assert_eq!(store.save(&mut p).await.unwrap(), "3");
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_removes_both_record_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut p = Policy::new(PolicyType::Ip, "10.0.0.1");
        let pid = store.save(&mut p).await.unwrap();
        store.delete(&pid).await.unwrap();

        assert!(store.get(&pid).await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 0);
        store.delete(&pid).await.unwrap(); // logged no-op
    }

    #[tokio::test]
    async fn test_list_active_ordering_matches_memory_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut old = Policy::new(PolicyType::Ip, "10.0.0.1");
        old.timestamp = now_ts() - 100.0;
        let mut newer = Policy::new(PolicyType::Ip, "10.0.0.2");
        store.save(&mut old).await.unwrap();
        store.save(&mut newer).await.unwrap();

        let active = store.list_active(ListOptions::default()).await.unwrap();
        assert_eq!(
            active.iter().map(|p| p.target.as_str()).collect::<Vec<_>>(),
            vec!["10.0.0.2", "10.0.0.1"]
        );
    }
}
