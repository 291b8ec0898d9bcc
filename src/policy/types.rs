//! The policy record and its field semantics.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Current wall-clock time as fractional epoch seconds, the unit every
/// lifecycle timestamp in a policy record uses.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// What a policy's `target` field refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyType {
    /// A literal IP address
    Ip,
    /// A device MAC address
    Mac,
    /// A domain name, suffix-matched unless `domainExactMatch` is set
    Domain,
    /// Same handling as `Domain`; kept as a distinct wire value
    Dns,
    /// A `mac:port:protocol` triplet on a specific device
    DevicePort,
    /// A named category backed by its own tracked IP set
    Category,
    /// Anything this build does not know how to enforce
    #[serde(other)]
    Unsupported,
}

impl PolicyType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Mac => "mac",
            Self::Domain => "domain",
            Self::Dns => "dns",
            Self::DevicePort => "devicePort",
            Self::Category => "category",
            Self::Unsupported => "unsupported",
        }
    }
}

/// A persisted access-control rule.
///
/// Field names mirror the stored hash layout (`policy:<pid>`), so a record
/// round-trips byte-compatible with what earlier firmware wrote. Boolean-ish
/// fields accept the legacy `"1"`/`"0"` string encoding on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Unique, monotonically allocated identifier. Empty until saved.
    #[serde(default)]
    pub pid: String,

    #[serde(rename = "type")]
    pub ptype: PolicyType,

    /// Semantics depend on `ptype`: an IP, a MAC, a domain name, a
    /// `mac:port:protocol` triplet, or a category name.
    pub target: String,

    /// Devices (MACs) the rule is restricted to; `None` means global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,

    /// Allow-exception instead of block; applied against distinct allow sets.
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "is_false")]
    pub whitelist: bool,

    /// Tri-state: `Some(true)` = explicitly disabled, `Some(false)` =
    /// explicitly enabled, `None` = field absent, meaning enabled.
    #[serde(default, deserialize_with = "tri_flag", skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,

    /// Seconds after activation at which the rule must auto-deactivate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<u64>,

    /// Cron expression for recurring rules; delegated to the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_time: Option<String>,

    /// How long each recurring activation lasts, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,

    /// Set when the rule transitions to enforced; cleared on clean
    /// un-enforcement. Survives a crash so re-enforcement resumes the
    /// original activation time instead of resetting the expiry clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_time: Option<f64>,

    /// Delete the record itself at expiry instead of just disabling it.
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "is_false")]
    pub auto_delete_when_expires: bool,

    /// Creation time; the ordering key in the active index.
    #[serde(default)]
    pub timestamp: f64,

    /// Exact domain match instead of suffix match.
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "is_false")]
    pub domain_exact_match: bool,

    /// Flagged by upstream consumers for later cleanup; carried on the
    /// record but never acted on by the enforcement path itself.
    #[serde(default, deserialize_with = "flag", skip_serializing_if = "is_false")]
    pub should_delete: bool,
}

impl Policy {
    /// Build an unsaved rule with the given type and target.
    pub fn new(ptype: PolicyType, target: impl Into<String>) -> Self {
        Self {
            pid: String::new(),
            ptype,
            target: target.into(),
            scope: None,
            whitelist: false,
            disabled: None,
            expire: None,
            cron_time: None,
            duration: None,
            activated_time: None,
            auto_delete_when_expires: false,
            timestamp: 0.0,
            domain_exact_match: false,
            should_delete: false,
        }
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_whitelist(mut self) -> Self {
        self.whitelist = true;
        self
    }

    pub fn with_expire(mut self, secs: u64) -> Self {
        self.expire = Some(secs);
        self
    }

    pub fn with_cron(mut self, cron_time: impl Into<String>, duration: u64) -> Self {
        self.cron_time = Some(cron_time.into());
        self.duration = Some(duration);
        self
    }

    /// Canonicalize the target case per type: MACs upper, domains lower.
    pub fn normalize(&mut self) {
        match self.ptype {
            PolicyType::Mac => self.target = self.target.to_uppercase(),
            PolicyType::Domain | PolicyType::Dns => self.target = self.target.to_lowercase(),
            _ => {}
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled == Some(true)
    }

    pub fn is_recurring(&self) -> bool {
        self.cron_time.is_some()
    }

    /// Structural equality for deduplication: two rules are the same logical
    /// rule when type, target, scope and whitelist semantics all match.
    pub fn is_same_rule(&self, other: &Policy) -> bool {
        self.ptype == other.ptype
            && self.target == other.target
            && self.scope == other.scope
            && self.whitelist == other.whitelist
    }

    /// Legacy schedule expressions (wildcard minute-and-hour) predate the
    /// current scheduler format; any leftover is stale data, not a real rule.
    pub fn has_legacy_schedule(&self) -> bool {
        self.cron_time
            .as_deref()
            .map(|c| c.starts_with("* *"))
            .unwrap_or(false)
    }

    /// The instant this rule's `expire` elapses, anchored to the original
    /// activation when one is recorded.
    pub fn expiry_instant(&self) -> Option<f64> {
        let expire = self.expire?;
        let base = self.activated_time.unwrap_or(self.timestamp);
        Some(base + expire as f64)
    }

    /// Whether the expiry already passed or falls within the lookahead guard,
    /// meaning activation on the backend should be skipped entirely.
    pub fn will_expire_soon(&self, now: f64, lookahead: Duration) -> bool {
        match self.expiry_instant() {
            Some(at) => at <= now + lookahead.as_secs_f64(),
            None => false,
        }
    }

    /// Residual lifetime until expiry, clamped non-negative.
    pub fn expire_residual(&self, now: f64) -> Duration {
        match self.expiry_instant() {
            Some(at) => Duration::from_secs_f64((at - now).max(0.0)),
            None => Duration::ZERO,
        }
    }
}

/// Merge instruction for a single optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Patch<T> {
    /// Leave the stored value untouched.
    #[default]
    Keep,
    Set(T),
    /// Drop the field from the record.
    Clear,
}

/// Partial update applied by [`PolicyStore::update`](super::PolicyStore::update).
///
/// The store reads the full current record, merges, then writes the complete
/// record back, so untouched fields are never silently dropped.
#[derive(Debug, Clone, Default)]
pub struct PolicyPatch {
    pub target: Option<String>,
    pub scope: Patch<Vec<String>>,
    pub whitelist: Option<bool>,
    pub disabled: Option<bool>,
    pub expire: Patch<u64>,
    /// cron expression and duration travel together.
    pub cron: Patch<(String, Option<u64>)>,
    pub activated_time: Patch<f64>,
    pub should_delete: Option<bool>,
}

impl PolicyPatch {
    pub fn disabled(value: bool) -> Self {
        Self {
            disabled: Some(value),
            ..Default::default()
        }
    }

    pub fn apply(&self, policy: &mut Policy) {
        if let Some(target) = &self.target {
            policy.target = target.clone();
        }
        match &self.scope {
            Patch::Keep => {}
            // an explicitly emptied scope is a deletion request
            Patch::Set(scope) if scope.is_empty() => policy.scope = None,
            Patch::Set(scope) => policy.scope = Some(scope.clone()),
            Patch::Clear => policy.scope = None,
        }
        if let Some(whitelist) = self.whitelist {
            policy.whitelist = whitelist;
        }
        if let Some(disabled) = self.disabled {
            policy.disabled = Some(disabled);
        }
        match &self.expire {
            Patch::Keep => {}
            Patch::Set(secs) => policy.expire = Some(*secs),
            Patch::Clear => policy.expire = None,
        }
        match &self.cron {
            Patch::Keep => {}
            Patch::Set((cron_time, duration)) => {
                policy.cron_time = Some(cron_time.clone());
                policy.duration = *duration;
            }
            Patch::Clear => {
                policy.cron_time = None;
                policy.duration = None;
            }
        }
        match &self.activated_time {
            Patch::Keep => {}
            Patch::Set(at) => policy.activated_time = Some(*at),
            Patch::Clear => policy.activated_time = None,
        }
        if let Some(should_delete) = self.should_delete {
            policy.should_delete = should_delete;
        }
        policy.normalize();
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Accepts `true`/`false`, `1`/`0`, and the legacy `"1"`/`"0"` strings.
fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(RawFlag::deserialize(d)?.as_bool().unwrap_or(false))
}

fn tri_flag<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(Option::<RawFlag>::deserialize(d)?.and_then(|f| f.as_bool()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlag {
    Bool(bool),
    Num(i64),
    Text(String),
}

impl RawFlag {
    fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Num(n) => Some(*n != 0),
            Self::Text(s) => match s.as_str() {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mac_uppercased() {
        let mut p = Policy::new(PolicyType::Mac, "aa:bb:cc:dd:ee:ff");
        p.normalize();
        assert_eq!(p.target, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_normalize_domain_lowercased() {
        let mut p = Policy::new(PolicyType::Domain, "Example.COM");
        p.normalize();
        assert_eq!(p.target, "example.com");

        let mut p = Policy::new(PolicyType::Dns, "CDN.Example.COM");
        p.normalize();
        assert_eq!(p.target, "cdn.example.com");
    }

    #[test]
    fn test_normalize_leaves_other_types_alone() {
        let mut p = Policy::new(PolicyType::Category, "Games");
        p.normalize();
        assert_eq!(p.target, "Games");
    }

    #[test]
    fn test_legacy_flag_encodings_parse() {
        let p: Policy = serde_json::from_value(serde_json::json!({
            "type": "ip",
            "target": "10.0.0.8",
            "disabled": "1",
            "whitelist": "0",
            "autoDeleteWhenExpires": 1,
            "shouldDelete": "1",
        }))
        .unwrap();
        assert!(p.is_disabled());
        assert!(!p.whitelist);
        assert!(p.auto_delete_when_expires);
        assert!(p.should_delete);
    }

    #[test]
    fn test_unknown_type_parses_as_unsupported() {
        let p: Policy = serde_json::from_value(serde_json::json!({
            "type": "quantum",
            "target": "whatever",
        }))
        .unwrap();
        assert_eq!(p.ptype, PolicyType::Unsupported);
    }

    #[test]
    fn test_same_rule_ignores_lifecycle_fields() {
        let a = Policy::new(PolicyType::Domain, "example.com").with_expire(600);
        let mut b = Policy::new(PolicyType::Domain, "example.com");
        b.pid = "12".into();
        b.disabled = Some(true);
        assert!(a.is_same_rule(&b));

        let c = Policy::new(PolicyType::Domain, "example.com").with_whitelist();
        assert!(!a.is_same_rule(&c));

        let d = Policy::new(PolicyType::Domain, "example.com").with_scope(vec!["AA".into()]);
        assert!(!a.is_same_rule(&d));
    }

    #[test]
    fn test_legacy_schedule_detected() {
        let p = Policy::new(PolicyType::Ip, "10.0.0.1").with_cron("* * * * *", 300);
        assert!(p.has_legacy_schedule());

        let p = Policy::new(PolicyType::Ip, "10.0.0.1").with_cron("0 22 * * *", 300);
        assert!(!p.has_legacy_schedule());
    }

    #[test]
    fn test_expiry_anchored_to_activation() {
        let mut p = Policy::new(PolicyType::Ip, "10.0.0.1").with_expire(100);
        p.timestamp = 1000.0;
        assert_eq!(p.expiry_instant(), Some(1100.0));

        // a surviving activation stamp takes precedence over creation time
        p.activated_time = Some(1050.0);
        assert_eq!(p.expiry_instant(), Some(1150.0));
    }

    #[test]
    fn test_will_expire_soon_with_lookahead() {
        let mut p = Policy::new(PolicyType::Ip, "10.0.0.1").with_expire(10);
        p.timestamp = 1000.0;
        assert!(!p.will_expire_soon(1000.0, Duration::from_secs(5)));
        assert!(p.will_expire_soon(1006.0, Duration::from_secs(5)));
        assert!(p.will_expire_soon(2000.0, Duration::ZERO));
    }

    #[test]
    fn test_expire_residual_clamped() {
        let mut p = Policy::new(PolicyType::Ip, "10.0.0.1").with_expire(10);
        p.timestamp = 1000.0;
        assert_eq!(p.expire_residual(1004.0), Duration::from_secs(6));
        assert_eq!(p.expire_residual(2000.0), Duration::ZERO);
    }

    #[test]
    fn test_patch_empty_scope_clears() {
        let mut p = Policy::new(PolicyType::Ip, "10.0.0.1").with_scope(vec!["AA".into()]);
        let patch = PolicyPatch {
            scope: Patch::Set(vec![]),
            ..Default::default()
        };
        patch.apply(&mut p);
        assert_eq!(p.scope, None);
    }

    #[test]
    fn test_patch_renormalizes_target() {
        let mut p = Policy::new(PolicyType::Mac, "AA:BB:CC:DD:EE:FF");
        let patch = PolicyPatch {
            target: Some("aa:bb:cc:dd:ee:00".into()),
            ..Default::default()
        };
        patch.apply(&mut p);
        assert_eq!(p.target, "AA:BB:CC:DD:EE:00");
    }

    #[test]
    fn test_patch_clears_cron_pair_together() {
        let mut p = Policy::new(PolicyType::Ip, "10.0.0.1").with_cron("0 22 * * *", 300);
        let patch = PolicyPatch {
            cron: Patch::Clear,
            ..Default::default()
        };
        patch.apply(&mut p);
        assert_eq!(p.cron_time, None);
        assert_eq!(p.duration, None);
    }
}
