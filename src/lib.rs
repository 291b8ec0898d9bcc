//! Policy enforcement engine for a network security appliance.
//!
//! policyd owns the lifecycle of network access-control rules (block/allow
//! directives keyed by IP, MAC, domain, device port, or category) and drives
//! their activation and deactivation against an underlying packet/DNS
//! filtering backend.
//!
//! Core pieces:
//! - [`policy`]: the persisted rule model, the indexed store and the safety
//!   and deduplication guard
//! - [`enforcement`]: the per-type dispatcher, the serialized job queue, the
//!   expiration manager and the recurring-policy bridge
//! - [`events`]: the cross-process trigger that lets any process request an
//!   enforcement change while exactly one process executes it
//! - [`engine`]: the [`engine::PolicyEngine`] tying everything together

pub mod audit;
pub mod config;
pub mod engine;
pub mod enforcement;
pub mod events;
pub mod policy;
pub mod telemetry;
