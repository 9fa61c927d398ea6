use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,

    /// Static session directory: session id -> backend voice server
    #[serde(default)]
    pub sessions: HashMap<Uuid, SocketAddr>,

    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Public UDP address voice clients send to
    #[serde(default = "default_relay_address")]
    pub address: String,

    /// Upper bound on concurrently established bridges
    #[serde(default)]
    pub max_bridges: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: default_relay_address(),
            max_bridges: None,
        }
    }
}

fn default_relay_address() -> String {
    "0.0.0.0:24454".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}
