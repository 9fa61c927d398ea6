mod types;
pub mod watcher;

pub use types::*;
pub use watcher::{watch_config_async, ConfigWatcher};

use crate::udp::SessionId;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)?;
        config.validate()?;

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_yml::from_str(content).with_context(|| "Failed to parse config file")
    }

    pub fn validate(&self) -> Result<()> {
        self.relay.bind_address()?;

        if self.relay.max_bridges == Some(0) {
            anyhow::bail!("relay.maxBridges must be greater than zero");
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .address
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid metrics address: {}", metrics.address))?;
        }

        for (session, backend) in &self.sessions {
            if backend.port() == 0 {
                anyhow::bail!("Session '{}' has backend {} without a port", session, backend);
            }
        }

        Ok(())
    }

    /// Session table keyed the way the relay looks sessions up
    pub fn session_table(&self) -> HashMap<SessionId, SocketAddr> {
        self.sessions
            .iter()
            .map(|(uuid, backend)| (SessionId::from(*uuid), *backend))
            .collect()
    }
}

impl RelayConfig {
    pub fn bind_address(&self) -> Result<SocketAddr> {
        self.address
            .parse()
            .with_context(|| format!("Invalid relay address: {}", self.address))
    }
}
