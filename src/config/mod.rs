//! YAML configuration for the daemon.

mod loader;
mod types;

pub use types::{Config, EnforcementConfig, StoreConfig};
