use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::{Config, StoreConfig};

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let StoreConfig::Persistent { path, .. } = &self.store {
            if path.as_os_str().is_empty() {
                anyhow::bail!("persistent store requires a non-empty path");
            }
        }

        if self.enforcement.queue_depth == 0 {
            anyhow::bail!("enforcement queue depth must be at least 1");
        }
        if self.enforcement.job_timeout.is_zero() {
            anyhow::bail!("enforcement job timeout must be non-zero");
        }

        if let Some(mac) = &self.identity.mac {
            if mac.len() != 17 || mac.split(':').count() != 6 {
                anyhow::bail!("identity mac is not a canonical MAC address: {mac}");
            }
        }
        for domain in &self.identity.protected_domains {
            if domain.is_empty() || domain == "*." {
                anyhow::bail!("empty protected domain entry");
            }
        }

        info!("configuration validated successfully");
        Ok(())
    }
}
