//! Safety and deduplication checks applied before any enforcement effect.

use serde::Deserialize;
use tracing::warn;

use super::types::Policy;

/// MAC address length in its canonical `AA:BB:CC:DD:EE:FF` form. DevicePort
/// targets carry a `:port:proto` suffix after this prefix.
const MAC_LEN: usize = 17;

/// The appliance's own addresses and names, as known at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemIdentity {
    /// Primary LAN address
    #[serde(default)]
    pub primary_ip: Option<String>,
    /// Secondary/overlay address
    #[serde(default)]
    pub secondary_ip: Option<String>,
    /// The appliance's own MAC
    #[serde(default)]
    pub mac: Option<String>,
    /// Hostname and any server identities the box answers to
    #[serde(default)]
    pub server_names: Vec<String>,
    /// Service domains that must stay reachable; exact names or `*.suffix`
    /// wildcard entries
    #[serde(default)]
    pub protected_domains: Vec<String>,
}

/// Unconditional guardrail: rules that would cut the appliance off from
/// itself or from its own cloud services are rejected before they reach the
/// blocking backend. Not user-overridable.
#[derive(Debug, Clone, Default)]
pub struct SafetyGuard {
    identity: SystemIdentity,
}

impl SafetyGuard {
    pub fn new(identity: SystemIdentity) -> Self {
        Self { identity }
    }

    /// Whether this rule's target resolves to the appliance itself.
    pub fn is_self_target(&self, policy: &Policy) -> bool {
        let target = policy.target.as_str();
        let id = &self.identity;

        if id.primary_ip.as_deref() == Some(target) || id.secondary_ip.as_deref() == Some(target) {
            return true;
        }

        // devicePort targets look like mac:port:proto; compare only the MAC
        // prefix, case-insensitively
        if let Some(mac) = &id.mac {
            if target.len() >= MAC_LEN && target[..MAC_LEN].eq_ignore_ascii_case(mac) {
                return true;
            }
        }

        if id.server_names.iter().any(|n| n.eq_ignore_ascii_case(target)) {
            return true;
        }

        id.protected_domains
            .iter()
            .any(|pattern| domain_matches(pattern, target))
    }
}

/// Exact match, or wildcard-suffix match for `*.domain` patterns.
fn domain_matches(pattern: &str, target: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        target
            .strip_suffix(suffix)
            .map(|head| head.ends_with('.'))
            .unwrap_or(false)
    } else {
        pattern.eq_ignore_ascii_case(target)
    }
}

/// All stored rules structurally equal to the candidate. The caller passes
/// the full active listing including disabled rules, since a disabled
/// duplicate is re-enabled rather than recreated.
pub fn find_duplicates<'a>(candidate: &Policy, policies: &'a [Policy]) -> Vec<&'a Policy> {
    let dups: Vec<&Policy> = policies
        .iter()
        .filter(|p| candidate.is_same_rule(p))
        .collect();
    if !dups.is_empty() {
        warn!(
            ptype = candidate.ptype.name(),
            target = %candidate.target,
            count = dups.len(),
            "rule already exists"
        );
    }
    dups
}
