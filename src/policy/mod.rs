//! Policy records and their persistence.
//!
//! A [`Policy`] is a persisted access-control rule (block or allow) with a
//! type, a target, an optional device scope and lifecycle metadata. All
//! policy state lives behind the [`PolicyStore`] trait:
//!
//! - [`MemoryPolicyStore`]: in-memory, volatile - for development/testing
//! - [`PersistentPolicyStore`]: fjall-backed, durable - for production
//!
//! The [`SafetyGuard`] sits in front of every enforcement path and rejects
//! rules that would cut the appliance off from itself or its own cloud.

mod guard;
mod memory;
mod persistent;
mod store;
mod types;

pub use guard::{find_duplicates, SafetyGuard, SystemIdentity};
pub use memory::MemoryPolicyStore;
pub use persistent::PersistentPolicyStore;
pub use store::{ListOptions, PolicyStore, SharedPolicyStore, COUNT_DISPLAY_CAP};
pub use types::{now_ts, Patch, Policy, PolicyPatch, PolicyType};
