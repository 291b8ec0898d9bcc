//! Recording implementations of the blocking collaborators.
//!
//! Used by tests and by dry-run deployments without a real filtering layer.
//! Every operation mutates observable in-memory state so set membership can
//! be asserted to round-trip.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::policy::Policy;

use super::backend::{
    BlockBackend, CategoryBlocker, DomainBlockOptions, DomainBlocker, HostEntry, HostLookup,
    IpMappingOptions, PortProtocol,
};
use super::scheduler::{RecurringScheduler, SchedulerHooks};

const DEFAULT_IP_SET: &str = "block_ip_set";
const DEFAULT_MAC_SET: &str = "block_mac_set";
const DEFAULT_IP_PORT_SET: &str = "block_ip_port_set";
const DEFAULT_DOMAIN_SET: &str = "block_domain_set";

/// An active scoped block tracked under a destination tag.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvancedEntry {
    pub tag: String,
    pub scope: Vec<String>,
    pub targets: Vec<String>,
    pub whitelist: bool,
}

#[derive(Default)]
struct BackendState {
    sets: HashMap<String, BTreeSet<String>>,
    advanced: HashMap<String, AdvancedEntry>,
    /// Destination tags with a live tracked IP set.
    tags: HashSet<String>,
    global_whitelist: bool,
}

/// In-memory [`BlockBackend`].
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<BackendState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, set: &str, member: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .sets
            .get(set)
            .map(|s| s.contains(member))
            .unwrap_or(false)
    }

    pub fn set_len(&self, set: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .sets
            .get(set)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// True when no set has members, no scoped block is active and global
    /// whitelist mode is off: observably equivalent to never having enforced.
    pub fn is_pristine(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.sets.values().all(|s| s.is_empty())
            && state.advanced.is_empty()
            && !state.global_whitelist
    }

    /// Every member across block sets whose name is not an allow set.
    pub fn block_set_members(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .sets
            .iter()
            .filter(|(name, _)| !name.starts_with("whitelist_"))
            .flat_map(|(_, members)| members.iter().cloned())
            .collect()
    }

    pub fn advanced_entry(&self, pid: &str) -> Option<AdvancedEntry> {
        self.state.lock().unwrap().advanced.get(pid).cloned()
    }

    pub fn tag_exists(&self, tag: &str) -> bool {
        self.state.lock().unwrap().tags.contains(tag)
    }

    pub fn global_whitelist(&self) -> bool {
        self.state.lock().unwrap().global_whitelist
    }

    fn add(&self, set: &str, member: &str) {
        self.state
            .lock()
            .unwrap()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn remove(&self, set: &str, member: &str) {
        if let Some(s) = self.state.lock().unwrap().sets.get_mut(set) {
            s.remove(member);
        }
    }
}

#[async_trait]
impl BlockBackend for MockBackend {
    async fn block(&self, target: &str, set: Option<&str>) -> Result<()> {
        self.add(set.unwrap_or(DEFAULT_IP_SET), target);
        Ok(())
    }

    async fn unblock(&self, target: &str, set: Option<&str>) -> Result<()> {
        self.remove(set.unwrap_or(DEFAULT_IP_SET), target);
        Ok(())
    }

    async fn block_mac(&self, mac: &str, set: Option<&str>) -> Result<()> {
        self.add(set.unwrap_or(DEFAULT_MAC_SET), mac);
        Ok(())
    }

    async fn unblock_mac(&self, mac: &str, set: Option<&str>) -> Result<()> {
        self.remove(set.unwrap_or(DEFAULT_MAC_SET), mac);
        Ok(())
    }

    async fn block_public_port(
        &self,
        ip: &str,
        port: u16,
        protocol: PortProtocol,
        set: Option<&str>,
    ) -> Result<()> {
        let member = format!("{ip}:{port}:{}", protocol.name());
        self.add(set.unwrap_or(DEFAULT_IP_PORT_SET), &member);
        Ok(())
    }

    async fn unblock_public_port(
        &self,
        ip: &str,
        port: u16,
        protocol: PortProtocol,
        set: Option<&str>,
    ) -> Result<()> {
        let member = format!("{ip}:{port}:{}", protocol.name());
        self.remove(set.unwrap_or(DEFAULT_IP_PORT_SET), &member);
        Ok(())
    }

    async fn advanced_block(
        &self,
        pid: &str,
        tag: &str,
        scope: &[String],
        targets: &[String],
        whitelist: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.tags.insert(tag.to_string());
        state.advanced.insert(
            pid.to_string(),
            AdvancedEntry {
                tag: tag.to_string(),
                scope: scope.to_vec(),
                targets: targets.to_vec(),
                whitelist,
            },
        );
        Ok(())
    }

    async fn advanced_unblock(
        &self,
        pid: &str,
        tag: &str,
        _scope: &[String],
        _targets: &[String],
        _whitelist: bool,
        destroy_tag: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.advanced.remove(pid);
        if destroy_tag {
            state.tags.remove(tag);
        }
        Ok(())
    }

    async fn enable_global_whitelist(&self) -> Result<()> {
        self.state.lock().unwrap().global_whitelist = true;
        Ok(())
    }

    async fn disable_global_whitelist(&self) -> Result<()> {
        self.state.lock().unwrap().global_whitelist = false;
        Ok(())
    }
}

#[derive(Default)]
struct DomainState {
    /// domain -> options it was blocked with
    blocked: HashMap<String, DomainBlockOptions>,
    mappings: Vec<String>,
    refreshed: Vec<(String, IpMappingOptions)>,
}

/// In-memory [`DomainBlocker`].
#[derive(Default)]
pub struct MockDomainBlocker {
    state: Mutex<DomainState>,
}

impl MockDomainBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mappings(mappings: Vec<String>) -> Self {
        Self {
            state: Mutex::new(DomainState {
                mappings,
                ..Default::default()
            }),
        }
    }

    pub fn blocked_with(&self, domain: &str) -> Option<DomainBlockOptions> {
        self.state.lock().unwrap().blocked.get(domain).cloned()
    }

    pub fn blocked_count(&self) -> usize {
        self.state.lock().unwrap().blocked.len()
    }

    pub fn refreshed(&self) -> Vec<(String, IpMappingOptions)> {
        self.state.lock().unwrap().refreshed.clone()
    }
}

#[async_trait]
impl DomainBlocker for MockDomainBlocker {
    async fn block_domain(&self, domain: &str, opts: DomainBlockOptions) -> Result<()> {
        let set = opts.block_set.as_deref().unwrap_or(DEFAULT_DOMAIN_SET);
        debug!(domain, set, "domain blocked");
        self.state
            .lock()
            .unwrap()
            .blocked
            .insert(domain.to_string(), opts);
        Ok(())
    }

    async fn unblock_domain(&self, domain: &str, _opts: DomainBlockOptions) -> Result<()> {
        self.state.lock().unwrap().blocked.remove(domain);
        Ok(())
    }

    async fn incremental_update_ip_mapping(
        &self,
        domain: &str,
        opts: IpMappingOptions,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .refreshed
            .push((domain.to_string(), opts));
        Ok(())
    }

    async fn all_ip_mappings(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().mappings.clone())
    }
}

/// In-memory [`CategoryBlocker`].
#[derive(Default)]
pub struct MockCategoryBlocker {
    blocked: Mutex<HashSet<(String, bool)>>,
}

impl MockCategoryBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_blocked(&self, category: &str, whitelist: bool) -> bool {
        self.blocked
            .lock()
            .unwrap()
            .contains(&(category.to_string(), whitelist))
    }
}

#[async_trait]
impl CategoryBlocker for MockCategoryBlocker {
    async fn block_category(&self, category: &str, whitelist: bool) -> Result<()> {
        self.blocked
            .lock()
            .unwrap()
            .insert((category.to_string(), whitelist));
        Ok(())
    }

    async fn unblock_category(&self, category: &str, whitelist: bool) -> Result<()> {
        self.blocked
            .lock()
            .unwrap()
            .remove(&(category.to_string(), whitelist));
        Ok(())
    }
}

/// Fixed MAC-to-IP inventory.
#[derive(Default)]
pub struct StaticHostLookup {
    hosts: HashMap<String, String>,
}

impl StaticHostLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, mac: impl Into<String>, ipv4: impl Into<String>) -> Self {
        self.hosts.insert(mac.into(), ipv4.into());
        self
    }
}

#[async_trait]
impl HostLookup for StaticHostLookup {
    async fn mac_entry(&self, mac: &str) -> Result<Option<HostEntry>> {
        Ok(self
            .hosts
            .get(mac)
            .map(|ipv4| HostEntry { ipv4: ipv4.clone() }))
    }
}

/// Scheduler stub that records registrations. The external cron engine is a
/// separate component; this stands in for it in tests and dry runs.
#[derive(Default)]
pub struct MockScheduler {
    hooks: Mutex<Option<SchedulerHooks>>,
    registered: Mutex<HashSet<String>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, pid: &str) -> bool {
        self.registered.lock().unwrap().contains(pid)
    }

    /// Simulate the schedule window opening: drive the injected activation
    /// callback the way the real scheduler would.
    pub async fn fire_activation(&self, policy: Policy) -> Result<()> {
        let hook = {
            let hooks = self.hooks.lock().unwrap();
            hooks.as_ref().map(|h| h.activate.clone())
        };
        match hook {
            Some(activate) => activate(policy).await,
            None => anyhow::bail!("scheduler hooks not bound"),
        }
    }
}

#[async_trait]
impl RecurringScheduler for MockScheduler {
    fn bind(&self, hooks: SchedulerHooks) {
        *self.hooks.lock().unwrap() = Some(hooks);
    }

    async fn register(&self, policy: &Policy) -> Result<()> {
        debug!(pid = %policy.pid, cron = ?policy.cron_time, "recurring policy registered");
        self.registered.lock().unwrap().insert(policy.pid.clone());
        Ok(())
    }

    async fn deregister(&self, policy: &Policy) -> Result<()> {
        self.registered.lock().unwrap().remove(&policy.pid);
        Ok(())
    }
}
