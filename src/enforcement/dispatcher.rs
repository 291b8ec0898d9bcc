//! Per-type translation of policies into blocking backend calls.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::policy::{
    now_ts, Patch, Policy, PolicyPatch, PolicyType, SafetyGuard, SharedPolicyStore,
};

use super::backend::{
    BlockBackend, CategoryBlocker, DomainBlockOptions, DomainBlocker, HostLookup,
    IpMappingOptions, PortProtocol, ALLOW_DOMAIN_SET, ALLOW_IP_PORT_SET, ALLOW_IP_SET,
    ALLOW_MAC_SET,
};

/// Failure modes of a single activation or deactivation.
#[derive(Debug, Error)]
pub enum EnforceError {
    /// The policy targets the appliance's own address, MAC or hostname.
    /// Rejected before any backend effect; never retried.
    #[error("policy {pid} targets the system itself ({target})")]
    SelfTarget { pid: String, target: String },

    /// Unknown policy type. Non-fatal; the record is left alone.
    #[error("policy {pid} has unsupported type {ptype}")]
    Unsupported { pid: String, ptype: String },

    #[error("store failure for policy {pid}")]
    Store {
        pid: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("backend failure for policy {pid}")]
    Backend {
        pid: String,
        #[source]
        source: anyhow::Error,
    },
}

impl EnforceError {
    /// Fatal errors must not be retried; the rule can never be applied.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SelfTarget { .. })
    }
}

fn mapping_patterns() -> &'static [(Regex, bool, bool)] {
    // (pattern, has_blockset, exact_match), checked in order so the
    // blockset-qualified forms win over the bare ones.
    static PATTERNS: OnceLock<Vec<(Regex, bool, bool)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r"^ipmapping:blockset:([^:]+):exactdomain:(.+)$").unwrap(),
                true,
                true,
            ),
            (
                Regex::new(r"^ipmapping:blockset:([^:]+):domain:(.+)$").unwrap(),
                true,
                false,
            ),
            (Regex::new(r"^ipmapping:exactdomain:(.+)$").unwrap(), false, true),
            (Regex::new(r"^ipmapping:domain:(.+)$").unwrap(), false, false),
        ]
    })
}

/// Parse a tracked mapping key into its domain and refresh options.
fn parse_mapping_key(key: &str) -> Option<(String, IpMappingOptions)> {
    for (re, has_blockset, exact_match) in mapping_patterns() {
        if let Some(caps) = re.captures(key) {
            let (block_set, domain) = if *has_blockset {
                (Some(caps[1].to_string()), caps[2].to_string())
            } else {
                (None, caps[1].to_string())
            };
            return Some((
                domain,
                IpMappingOptions {
                    block_set,
                    exact_match: *exact_match,
                },
            ));
        }
    }
    None
}

/// Translates a policy into calls on the blocking collaborators, for both
/// activation and deactivation. Holds no mutable state of its own; all
/// serialization happens upstream in the job queue.
pub struct Dispatcher {
    store: SharedPolicyStore,
    backend: Arc<dyn BlockBackend>,
    domains: Arc<dyn DomainBlocker>,
    categories: Arc<dyn CategoryBlocker>,
    hosts: Arc<dyn HostLookup>,
    guard: SafetyGuard,
}

impl Dispatcher {
    pub fn new(
        store: SharedPolicyStore,
        backend: Arc<dyn BlockBackend>,
        domains: Arc<dyn DomainBlocker>,
        categories: Arc<dyn CategoryBlocker>,
        hosts: Arc<dyn HostLookup>,
        guard: SafetyGuard,
    ) -> Self {
        Self {
            store,
            backend,
            domains,
            categories,
            hosts,
            guard,
        }
    }

    /// Apply a policy's effect on the backend.
    ///
    /// Disabled policies are a logged no-op. The self-target guard runs
    /// before any backend call. An activation stamp is written back to the
    /// store, preserving a prior stamp so a rule re-applied after an unclean
    /// shutdown keeps its original activation time.
    pub async fn activate(&self, policy: &Policy) -> Result<(), EnforceError> {
        if policy.is_disabled() {
            debug!(pid = %policy.pid, "policy disabled, skipping activation");
            return Ok(());
        }

        let policy = self.refresh_activated_time(policy).await?;

        if self.guard.is_self_target(&policy) {
            return Err(EnforceError::SelfTarget {
                pid: policy.pid.clone(),
                target: policy.target.clone(),
            });
        }

        if policy.whitelist {
            self.backend
                .enable_global_whitelist()
                .await
                .map_err(|source| EnforceError::Backend {
                    pid: policy.pid.clone(),
                    source,
                })?;
        }

        let result = self.apply(&policy).await;
        match &result {
            Ok(()) => info!(pid = %policy.pid, ptype = policy.ptype.name(), target = %policy.target, "policy activated"),
            Err(err) => warn!(pid = %policy.pid, error = %err, "policy activation failed"),
        }
        result.map_err(|source| match source.downcast::<EnforceError>() {
            Ok(err) => err,
            Err(source) => EnforceError::Backend {
                pid: policy.pid.clone(),
                source,
            },
        })
    }

    async fn apply(&self, policy: &Policy) -> anyhow::Result<()> {
        let pid = policy.pid.as_str();
        let target = policy.target.as_str();
        match (&policy.ptype, policy.scope.as_deref()) {
            (PolicyType::Ip, None) => {
                let set = policy.whitelist.then_some(ALLOW_IP_SET);
                self.backend.block(target, set).await
            }
            (PolicyType::Ip, Some(scope)) => {
                self.backend
                    .advanced_block(pid, pid, scope, &[target.to_string()], policy.whitelist)
                    .await
            }
            (PolicyType::Mac, _) => {
                let set = policy.whitelist.then_some(ALLOW_MAC_SET);
                self.backend.block_mac(target, set).await
            }
            (PolicyType::Domain | PolicyType::Dns, None) => {
                // Allow rules must not write dnsmasq filter entries; the
                // allow set alone carries the exemption.
                let opts = DomainBlockOptions {
                    exact_match: policy.domain_exact_match,
                    block_set: policy.whitelist.then(|| ALLOW_DOMAIN_SET.to_string()),
                    no_dnsmasq_entry: policy.whitelist,
                    no_dnsmasq_reload: policy.whitelist,
                };
                self.domains.block_domain(target, opts).await
            }
            (PolicyType::Domain | PolicyType::Dns, Some(scope)) => {
                self.backend
                    .advanced_block(pid, pid, scope, &[], policy.whitelist)
                    .await?;
                // Resolved IPs for this domain feed the per-rule set, so no
                // global dnsmasq entry is written.
                let opts = DomainBlockOptions {
                    exact_match: policy.domain_exact_match,
                    block_set: Some(self.backend.dst_set(pid)),
                    no_dnsmasq_entry: true,
                    no_dnsmasq_reload: true,
                };
                self.domains.block_domain(target, opts).await
            }
            (PolicyType::DevicePort, _) => match self.parse_device_port(policy)? {
                Some((mac, port, protocol)) => match self.hosts.mac_entry(&mac).await? {
                    Some(host) => {
                        let set = policy.whitelist.then_some(ALLOW_IP_PORT_SET);
                        self.backend
                            .block_public_port(&host.ipv4, port, protocol, set)
                            .await
                    }
                    None => {
                        warn!(pid, mac = %mac, "device not found, skipping port block");
                        Ok(())
                    }
                },
                None => Ok(()),
            },
            (PolicyType::Category, None) => {
                self.categories.block_category(target, policy.whitelist).await
            }
            (PolicyType::Category, Some(scope)) => {
                // Scoped category rules share the category name as their
                // destination tag; the category set is maintained once.
                self.backend
                    .advanced_block(pid, target, scope, &[], policy.whitelist)
                    .await
            }
            (PolicyType::Unsupported, _) => Err(EnforceError::Unsupported {
                pid: pid.to_string(),
                ptype: "unknown".to_string(),
            }
            .into()),
        }
    }

    /// Remove a policy's effect from the backend, mirroring every
    /// activation path with the symmetric primitives.
    pub async fn deactivate(&self, policy: &Policy) -> Result<(), EnforceError> {
        let pid = policy.pid.as_str();
        let target = policy.target.as_str();
        let result: anyhow::Result<()> = async {
            match (&policy.ptype, policy.scope.as_deref()) {
                (PolicyType::Ip, None) => {
                    let set = policy.whitelist.then_some(ALLOW_IP_SET);
                    self.backend.unblock(target, set).await?;
                }
                (PolicyType::Ip, Some(scope)) => {
                    self.backend
                        .advanced_unblock(
                            pid,
                            pid,
                            scope,
                            &[target.to_string()],
                            policy.whitelist,
                            true,
                        )
                        .await?;
                }
                (PolicyType::Mac, _) => {
                    let set = policy.whitelist.then_some(ALLOW_MAC_SET);
                    self.backend.unblock_mac(target, set).await?;
                }
                (PolicyType::Domain | PolicyType::Dns, None) => {
                    let opts = DomainBlockOptions {
                        exact_match: policy.domain_exact_match,
                        block_set: policy.whitelist.then(|| ALLOW_DOMAIN_SET.to_string()),
                        no_dnsmasq_entry: policy.whitelist,
                        no_dnsmasq_reload: policy.whitelist,
                    };
                    self.domains.unblock_domain(target, opts).await?;
                }
                (PolicyType::Domain | PolicyType::Dns, Some(scope)) => {
                    let opts = DomainBlockOptions {
                        exact_match: policy.domain_exact_match,
                        block_set: Some(self.backend.dst_set(pid)),
                        no_dnsmasq_entry: true,
                        no_dnsmasq_reload: true,
                    };
                    self.domains.unblock_domain(target, opts).await?;
                    // Per-rule destination tags are destroyed on teardown.
                    self.backend
                        .advanced_unblock(pid, pid, scope, &[], policy.whitelist, true)
                        .await?;
                }
                (PolicyType::DevicePort, _) => {
                    if let Some((mac, port, protocol)) = self.parse_device_port(policy)? {
                        if let Some(host) = self.hosts.mac_entry(&mac).await? {
                            let set = policy.whitelist.then_some(ALLOW_IP_PORT_SET);
                            self.backend
                                .unblock_public_port(&host.ipv4, port, protocol, set)
                                .await?;
                        }
                    }
                }
                (PolicyType::Category, None) => {
                    self.categories
                        .unblock_category(target, policy.whitelist)
                        .await?;
                }
                (PolicyType::Category, Some(scope)) => {
                    // Categories are few and stable; their shared destination
                    // tag outlives any single rule and is retained.
                    self.backend
                        .advanced_unblock(pid, target, scope, &[], policy.whitelist, false)
                        .await?;
                }
                (PolicyType::Unsupported, _) => {
                    return Err(EnforceError::Unsupported {
                        pid: pid.to_string(),
                        ptype: "unknown".to_string(),
                    }
                    .into());
                }
            }
            Ok(())
        }
        .await;

        if let Err(source) = result {
            warn!(pid, error = %source, "policy deactivation failed");
            return Err(match source.downcast::<EnforceError>() {
                Ok(err) => err,
                Err(source) => EnforceError::Backend {
                    pid: pid.to_string(),
                    source,
                },
            });
        }

        // Taking down any allow rule drops global whitelist mode.
        if policy.whitelist {
            if let Err(err) = self.backend.disable_global_whitelist().await {
                warn!(pid, error = %err, "failed to disable global whitelist");
            }
        }

        self.clear_activated_time(pid).await;
        info!(pid, ptype = policy.ptype.name(), target, "policy deactivated");
        Ok(())
    }

    /// Re-derive the IP-mapping state of every tracked domain. This is a
    /// reconciliation pass; a failure on one key never blocks the rest.
    pub async fn incremental_update(&self) -> anyhow::Result<()> {
        let keys = self.domains.all_ip_mappings().await?;
        debug!(count = keys.len(), "refreshing tracked ip mappings");
        for key in keys {
            let Some((domain, opts)) = parse_mapping_key(&key) else {
                warn!(key = %key, "unrecognized ip mapping key");
                continue;
            };
            if let Err(err) = self
                .domains
                .incremental_update_ip_mapping(&domain, opts)
                .await
            {
                warn!(domain = %domain, error = %err, "ip mapping refresh failed");
            }
        }
        Ok(())
    }

    fn parse_device_port(
        &self,
        policy: &Policy,
    ) -> anyhow::Result<Option<(String, u16, PortProtocol)>> {
        // Target layout is mac:port:protocol; the mac itself contains colons
        // so the split runs from the right.
        let mut parts = policy.target.rsplitn(3, ':');
        let (Some(proto), Some(port), Some(mac)) = (parts.next(), parts.next(), parts.next())
        else {
            warn!(pid = %policy.pid, target = %policy.target, "malformed devicePort target");
            return Ok(None);
        };
        let port: u16 = match port.parse() {
            Ok(p) => p,
            Err(_) => {
                warn!(pid = %policy.pid, target = %policy.target, "bad port in devicePort target");
                return Ok(None);
            }
        };
        let protocol: PortProtocol = proto.parse()?;
        Ok(Some((mac.to_string(), port, protocol)))
    }

    async fn refresh_activated_time(&self, policy: &Policy) -> Result<Policy, EnforceError> {
        let stored = self
            .store
            .get(&policy.pid)
            .await
            .map_err(|source| EnforceError::Store {
                pid: policy.pid.clone(),
                source,
            })?;
        let mut current = stored.unwrap_or_else(|| policy.clone());
        if current.activated_time.is_none() {
            let now = now_ts();
            current.activated_time = Some(now);
            let patch = PolicyPatch {
                activated_time: Patch::Set(now),
                ..Default::default()
            };
            if let Err(source) = self.store.update(&policy.pid, patch).await {
                // Persisting the stamp is best effort; the in-memory copy
                // still carries it for expiry computation.
                warn!(pid = %policy.pid, error = %source, "failed to persist activation time");
            }
        }
        Ok(current)
    }

    async fn clear_activated_time(&self, pid: &str) {
        match self.store.get(pid).await {
            Ok(Some(_)) => {
                let patch = PolicyPatch {
                    activated_time: Patch::Clear,
                    ..Default::default()
                };
                if let Err(err) = self.store.update(pid, patch).await {
                    warn!(pid, error = %err, "failed to clear activation time");
                }
            }
            // Already deleted; nothing to clear.
            Ok(None) => {}
            Err(err) => warn!(pid, error = %err, "failed to read policy after deactivation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{MemoryPolicyStore, PolicyStore, SystemIdentity};
    use crate::enforcement::mock::{
        MockBackend, MockCategoryBlocker, MockDomainBlocker, StaticHostLookup,
    };

    struct Fixture {
        store: Arc<MemoryPolicyStore>,
        backend: Arc<MockBackend>,
        domains: Arc<MockDomainBlocker>,
        categories: Arc<MockCategoryBlocker>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        fixture_with(
            Arc::new(MockDomainBlocker::new()),
            Arc::new(StaticHostLookup::new().with_host("AA:BB:CC:DD:EE:FF", "192.168.1.20")),
        )
    }

    fn fixture_with(domains: Arc<MockDomainBlocker>, hosts: Arc<StaticHostLookup>) -> Fixture {
        let store = Arc::new(MemoryPolicyStore::new());
        let backend = Arc::new(MockBackend::new());
        let categories = Arc::new(MockCategoryBlocker::new());
        let identity = SystemIdentity {
            primary_ip: Some("192.168.1.1".into()),
            secondary_ip: Some("192.168.2.1".into()),
            mac: Some("02:01:22:33:44:55".into()),
            server_names: vec!["gateway.local".into()],
            protected_domains: vec!["*.example-vendor.net".into()],
        };
        let dispatcher = Dispatcher::new(
            store.clone(),
            backend.clone(),
            domains.clone(),
            categories.clone(),
            hosts,
            SafetyGuard::new(identity),
        );
        Fixture {
            store,
            backend,
            domains,
            categories,
            dispatcher,
        }
    }

    async fn saved(fx: &Fixture, mut policy: Policy) -> Policy {
        fx.store.save(&mut policy).await.unwrap();
        policy
    }

    #[tokio::test]
    async fn ip_block_round_trips() {
        let fx = fixture();
        let policy = saved(&fx, Policy::new(PolicyType::Ip, "10.0.0.9")).await;
        fx.dispatcher.activate(&policy).await.unwrap();
        assert!(fx.backend.contains("block_ip_set", "10.0.0.9"));
        fx.dispatcher.deactivate(&policy).await.unwrap();
        assert!(fx.backend.is_pristine());
    }

    #[tokio::test]
    async fn whitelist_ip_uses_allow_set_only() {
        let fx = fixture();
        let policy = saved(
            &fx,
            Policy::new(PolicyType::Ip, "10.0.0.9").with_whitelist(),
        )
        .await;
        fx.dispatcher.activate(&policy).await.unwrap();
        assert!(fx.backend.contains(ALLOW_IP_SET, "10.0.0.9"));
        assert!(fx.backend.block_set_members().is_empty());
        assert!(fx.backend.global_whitelist());
        fx.dispatcher.deactivate(&policy).await.unwrap();
        assert!(!fx.backend.global_whitelist());
    }

    #[tokio::test]
    async fn any_allow_rule_teardown_drops_global_whitelist() {
        let fx = fixture();
        let first = saved(
            &fx,
            Policy::new(PolicyType::Ip, "10.0.0.9").with_whitelist(),
        )
        .await;
        let second = saved(
            &fx,
            Policy::new(PolicyType::Mac, "aa:aa:aa:bb:bb:bb").with_whitelist(),
        )
        .await;
        fx.dispatcher.activate(&first).await.unwrap();
        fx.dispatcher.activate(&second).await.unwrap();
        assert!(fx.backend.global_whitelist());
        // Removing either allow rule turns the mode off; re-activation of a
        // surviving rule turns it back on.
        fx.dispatcher.deactivate(&first).await.unwrap();
        assert!(!fx.backend.global_whitelist());
        fx.dispatcher.activate(&second).await.unwrap();
        assert!(fx.backend.global_whitelist());
        fx.dispatcher.deactivate(&second).await.unwrap();
        assert!(!fx.backend.global_whitelist());
    }

    #[tokio::test]
    async fn whitelist_domain_skips_dnsmasq_entry() {
        let fx = fixture();
        let policy = saved(
            &fx,
            Policy::new(PolicyType::Domain, "good.example.com").with_whitelist(),
        )
        .await;
        fx.dispatcher.activate(&policy).await.unwrap();
        let opts = fx.domains.blocked_with("good.example.com").unwrap();
        assert_eq!(opts.block_set.as_deref(), Some(ALLOW_DOMAIN_SET));
        assert!(opts.no_dnsmasq_entry);
        assert!(opts.no_dnsmasq_reload);
        fx.dispatcher.deactivate(&policy).await.unwrap();
        assert!(fx.domains.blocked_with("good.example.com").is_none());
        assert!(!fx.backend.global_whitelist());
    }

    #[tokio::test]
    async fn self_target_rejected_before_backend() {
        let fx = fixture();
        for target in ["192.168.1.1", "02:01:22:33:44:55", "gateway.local"] {
            let ptype = if target.contains("::") || target.len() == 17 {
                PolicyType::Mac
            } else if target.chars().next().unwrap().is_ascii_digit() {
                PolicyType::Ip
            } else {
                PolicyType::Domain
            };
            let policy = saved(&fx, Policy::new(ptype, target)).await;
            let err = fx.dispatcher.activate(&policy).await.unwrap_err();
            assert!(err.is_fatal(), "{target} should be fatal");
        }
        assert!(fx.backend.is_pristine());
    }

    #[tokio::test]
    async fn scoped_ip_tracks_per_rule_tag() {
        let fx = fixture();
        let policy = saved(
            &fx,
            Policy::new(PolicyType::Ip, "10.0.0.9").with_scope(vec!["AA:BB:CC:DD:EE:FF".into()]),
        )
        .await;
        fx.dispatcher.activate(&policy).await.unwrap();
        let entry = fx.backend.advanced_entry(&policy.pid).unwrap();
        assert_eq!(entry.tag, policy.pid);
        assert_eq!(entry.targets, vec!["10.0.0.9".to_string()]);
        fx.dispatcher.deactivate(&policy).await.unwrap();
        assert!(fx.backend.advanced_entry(&policy.pid).is_none());
        assert!(!fx.backend.tag_exists(&policy.pid));
    }

    #[tokio::test]
    async fn scoped_domain_binds_dst_set_and_destroys_tag() {
        let fx = fixture();
        let policy = saved(
            &fx,
            Policy::new(PolicyType::Domain, "ads.example.com")
                .with_scope(vec!["AA:BB:CC:DD:EE:FF".into()]),
        )
        .await;
        fx.dispatcher.activate(&policy).await.unwrap();
        let opts = fx.domains.blocked_with("ads.example.com").unwrap();
        assert_eq!(opts.block_set.as_deref(), Some(&*format!("policy_dst_{}", policy.pid)));
        assert!(opts.no_dnsmasq_entry);
        fx.dispatcher.deactivate(&policy).await.unwrap();
        assert!(fx.domains.blocked_with("ads.example.com").is_none());
        assert!(!fx.backend.tag_exists(&policy.pid));
    }

    #[tokio::test]
    async fn scoped_category_shares_tag_and_retains_it() {
        let fx = fixture();
        let policy = saved(
            &fx,
            Policy::new(PolicyType::Category, "games")
                .with_scope(vec!["AA:BB:CC:DD:EE:FF".into()]),
        )
        .await;
        fx.dispatcher.activate(&policy).await.unwrap();
        let entry = fx.backend.advanced_entry(&policy.pid).unwrap();
        assert_eq!(entry.tag, "games");
        fx.dispatcher.deactivate(&policy).await.unwrap();
        assert!(fx.backend.advanced_entry(&policy.pid).is_none());
        assert!(fx.backend.tag_exists("games"));
    }

    #[tokio::test]
    async fn device_port_resolves_mac() {
        let fx = fixture();
        let policy = saved(
            &fx,
            Policy::new(PolicyType::DevicePort, "AA:BB:CC:DD:EE:FF:8080:tcp"),
        )
        .await;
        fx.dispatcher.activate(&policy).await.unwrap();
        assert!(fx
            .backend
            .contains("block_ip_port_set", "192.168.1.20:8080:tcp"));
        fx.dispatcher.deactivate(&policy).await.unwrap();
        assert!(fx.backend.is_pristine());
    }

    #[tokio::test]
    async fn device_port_unresolvable_mac_is_noop() {
        let fx = fixture();
        let policy = saved(
            &fx,
            Policy::new(PolicyType::DevicePort, "11:22:33:44:55:66:443:udp"),
        )
        .await;
        fx.dispatcher.activate(&policy).await.unwrap();
        assert!(fx.backend.is_pristine());
    }

    #[tokio::test]
    async fn category_global_path() {
        let fx = fixture();
        let policy = saved(&fx, Policy::new(PolicyType::Category, "porn")).await;
        fx.dispatcher.activate(&policy).await.unwrap();
        assert!(fx.categories.is_blocked("porn", false));
        fx.dispatcher.deactivate(&policy).await.unwrap();
        assert!(!fx.categories.is_blocked("porn", false));
    }

    #[tokio::test]
    async fn disabled_policy_is_noop() {
        let fx = fixture();
        let mut policy = Policy::new(PolicyType::Ip, "10.0.0.9");
        policy.disabled = Some(true);
        let policy = saved(&fx, policy).await;
        fx.dispatcher.activate(&policy).await.unwrap();
        assert!(fx.backend.is_pristine());
    }

    #[tokio::test]
    async fn activation_stamp_written_and_cleared() {
        let fx = fixture();
        let policy = saved(&fx, Policy::new(PolicyType::Ip, "10.0.0.9")).await;
        fx.dispatcher.activate(&policy).await.unwrap();
        let stored = fx.store.get(&policy.pid).await.unwrap().unwrap();
        assert!(stored.activated_time.is_some());
        fx.dispatcher.deactivate(&policy).await.unwrap();
        let stored = fx.store.get(&policy.pid).await.unwrap().unwrap();
        assert!(stored.activated_time.is_none());
    }

    #[tokio::test]
    async fn activation_stamp_preserved_on_reenforce() {
        let fx = fixture();
        let policy = saved(&fx, Policy::new(PolicyType::Ip, "10.0.0.9")).await;
        let patch = PolicyPatch {
            activated_time: Patch::Set(1000.0),
            ..Default::default()
        };
        fx.store.update(&policy.pid, patch).await.unwrap();
        fx.dispatcher.activate(&policy).await.unwrap();
        let stored = fx.store.get(&policy.pid).await.unwrap().unwrap();
        assert_eq!(stored.activated_time, Some(1000.0));
    }

    #[tokio::test]
    async fn incremental_update_covers_all_key_forms() {
        let domains = Arc::new(MockDomainBlocker::with_mappings(vec![
            "ipmapping:domain:plain.example.com".into(),
            "ipmapping:exactdomain:exact.example.com".into(),
            "ipmapping:blockset:policy_dst_7:domain:scoped.example.com".into(),
            "ipmapping:blockset:policy_dst_8:exactdomain:pin.example.com".into(),
            "garbage-key".into(),
        ]));
        let fx = fixture_with(domains.clone(), Arc::new(StaticHostLookup::new()));
        fx.dispatcher.incremental_update().await.unwrap();
        let refreshed = domains.refreshed();
        assert_eq!(refreshed.len(), 4);
        assert!(refreshed.contains(&(
            "plain.example.com".into(),
            IpMappingOptions::default()
        )));
        assert!(refreshed.contains(&(
            "exact.example.com".into(),
            IpMappingOptions {
                block_set: None,
                exact_match: true
            }
        )));
        assert!(refreshed.contains(&(
            "scoped.example.com".into(),
            IpMappingOptions {
                block_set: Some("policy_dst_7".into()),
                exact_match: false
            }
        )));
        assert!(refreshed.contains(&(
            "pin.example.com".into(),
            IpMappingOptions {
                block_set: Some("policy_dst_8".into()),
                exact_match: true
            }
        )));
    }
}
