//! The storage seam for policy records.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::types::{Policy, PolicyPatch};

/// Display cap for the rule counter; the UI never shows more than this.
pub const COUNT_DISPLAY_CAP: u64 = 20;

/// Options for [`PolicyStore::list_active`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Max records to return; `None` uses the store's configured capacity.
    pub number: Option<usize>,
    /// Include explicitly disabled rules (used by duplicate detection).
    pub including_disabled: bool,
}

/// Persisted policy storage: the per-policy records, the timestamp-scored
/// active index, and the id counter. All implementations are thread-safe.
///
/// Stores never interpret a rule; callers own the lifecycle transitions and
/// the store keeps the record and the index consistent with each other.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Allocate the next policy id. The counter is lazily initialized; the
    /// first allocation returns 1.
    async fn allocate_id(&self) -> Result<u64>;

    /// Assign an id, normalize, persist all fields and add the rule to the
    /// active index scored by its creation timestamp. Returns the new pid.
    async fn save(&self, policy: &mut Policy) -> Result<String>;

    /// Merge a partial update into an existing record: the full record is
    /// read, patched and written back, so fields outside the patch survive.
    async fn update(&self, pid: &str, patch: PolicyPatch) -> Result<()>;

    async fn get(&self, pid: &str) -> Result<Option<Policy>>;

    /// Remove the record and its index entry together. Deleting an unknown
    /// pid logs an error and is otherwise a no-op.
    async fn delete(&self, pid: &str) -> Result<()>;

    /// Active rules, most recent first, capped at the store capacity.
    /// Malformed stored records are logged and skipped, never propagated.
    async fn list_active(&self, opts: ListOptions) -> Result<Vec<Policy>>;

    /// Rules created within the trailing window, most recent first.
    async fn list_recent(&self, window_secs: u64) -> Result<Vec<Policy>>;

    /// Number of indexed rules, capped at [`COUNT_DISPLAY_CAP`] for display.
    async fn count(&self) -> Result<u64>;
}

/// Shared store handle.
pub type SharedPolicyStore = Arc<dyn PolicyStore>;

/// Index score for a record: creation time in integer milliseconds, which
/// keeps byte-order and numeric order aligned for the persistent index.
pub(crate) fn index_score(timestamp: f64) -> u64 {
    (timestamp * 1000.0) as u64
}

/// Shared read-side record parsing: one corrupt entry never blocks the rest.
pub(crate) fn parse_record(pid: &str, raw: &[u8]) -> Option<Policy> {
    match serde_json::from_slice::<Policy>(raw) {
        Ok(policy) => Some(policy),
        Err(e) => {
            tracing::error!(pid, error = %e, "skipping malformed policy record");
            None
        }
    }
}
