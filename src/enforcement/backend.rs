//! Interfaces onto the packet/DNS blocking collaborators.
//!
//! The engine never touches ipsets, dnsmasq or iptables itself; it drives
//! these traits. Production wires them to the platform's blocking layer,
//! tests and dry runs use the recording implementations in [`super::mock`].

use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;

/// Allow-set names for whitelist rules, distinct from the default block sets.
pub const ALLOW_IP_SET: &str = "whitelist_ip_set";
pub const ALLOW_MAC_SET: &str = "whitelist_mac_set";
pub const ALLOW_DOMAIN_SET: &str = "whitelist_domain_set";
pub const ALLOW_IP_PORT_SET: &str = "whitelist_ip_port_set";

/// Transport protocol in a devicePort target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl PortProtocol {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl FromStr for PortProtocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => anyhow::bail!("unknown protocol: {other}"),
        }
    }
}

/// The low-level blocking engine, operating on IP sets.
#[async_trait]
pub trait BlockBackend: Send + Sync {
    /// Block an address, optionally in a named set instead of the default.
    async fn block(&self, target: &str, set: Option<&str>) -> Result<()>;
    async fn unblock(&self, target: &str, set: Option<&str>) -> Result<()>;

    async fn block_mac(&self, mac: &str, set: Option<&str>) -> Result<()>;
    async fn unblock_mac(&self, mac: &str, set: Option<&str>) -> Result<()>;

    async fn block_public_port(
        &self,
        ip: &str,
        port: u16,
        protocol: PortProtocol,
        set: Option<&str>,
    ) -> Result<()>;
    async fn unblock_public_port(
        &self,
        ip: &str,
        port: u16,
        protocol: PortProtocol,
        set: Option<&str>,
    ) -> Result<()>;

    /// Scoped block: applies only to the given device set, tracked under a
    /// destination tag (`tag` is the pid for per-rule tags, or a shared name
    /// for category rules).
    async fn advanced_block(
        &self,
        pid: &str,
        tag: &str,
        scope: &[String],
        targets: &[String],
        whitelist: bool,
    ) -> Result<()>;

    /// Mirror of [`advanced_block`](Self::advanced_block). `destroy_tag`
    /// controls whether the destination tag's tracked IP set is torn down or
    /// retained for reuse.
    async fn advanced_unblock(
        &self,
        pid: &str,
        tag: &str,
        scope: &[String],
        targets: &[String],
        whitelist: bool,
        destroy_tag: bool,
    ) -> Result<()>;

    /// Global whitelist mode: flips the backend from default-allow to
    /// default-deny-except-allow-sets.
    async fn enable_global_whitelist(&self) -> Result<()>;
    async fn disable_global_whitelist(&self) -> Result<()>;

    /// Name of the per-rule destination IP set.
    fn dst_set(&self, pid: &str) -> String {
        format!("policy_dst_{pid}")
    }
}

/// Options threaded through domain block/unblock calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainBlockOptions {
    pub exact_match: bool,
    /// Feed resolved IPs into this set instead of the default block set.
    pub block_set: Option<String>,
    /// Skip the dnsmasq config entry (scoped and whitelist rules resolve
    /// through the tracked set, not a global DNS rewrite).
    pub no_dnsmasq_entry: bool,
    pub no_dnsmasq_reload: bool,
}

/// Options for re-deriving a single tracked domain's IP mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpMappingOptions {
    pub block_set: Option<String>,
    pub exact_match: bool,
}

/// Domain blocking and the domain-to-IP mapping tracker.
#[async_trait]
pub trait DomainBlocker: Send + Sync {
    async fn block_domain(&self, domain: &str, opts: DomainBlockOptions) -> Result<()>;
    async fn unblock_domain(&self, domain: &str, opts: DomainBlockOptions) -> Result<()>;

    /// Refresh one tracked domain's resolved-IP state.
    async fn incremental_update_ip_mapping(
        &self,
        domain: &str,
        opts: IpMappingOptions,
    ) -> Result<()>;

    /// Every tracked mapping key, in the forms `ipmapping:domain:<d>`,
    /// `ipmapping:blockset:<b>:domain:<d>`, `ipmapping:exactdomain:<d>` and
    /// `ipmapping:blockset:<b>:exactdomain:<d>`.
    async fn all_ip_mappings(&self) -> Result<Vec<String>>;
}

/// Category blocking; each category maintains its own tracked IP set.
#[async_trait]
pub trait CategoryBlocker: Send + Sync {
    async fn block_category(&self, category: &str, whitelist: bool) -> Result<()>;
    async fn unblock_category(&self, category: &str, whitelist: bool) -> Result<()>;
}

/// A device known to the appliance.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub ipv4: String,
}

/// Device lookup by MAC, backed by the host inventory.
#[async_trait]
pub trait HostLookup: Send + Sync {
    async fn mac_entry(&self, mac: &str) -> Result<Option<HostEntry>>;
}
