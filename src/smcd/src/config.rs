use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use rdma::{Mtu, PortState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TracingConfig {
    pub enable: bool,
    pub min_event_level: String,
    pub max_event_level: String,
    pub span_level: String,
    pub output_dir: String,
}

fn port_state_active() -> PortState {
    PortState::Active
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    /// MAC of the network device behind the port, e.g. "02:00:00:00:00:01".
    pub mac: Option<String>,
    #[serde(default = "port_state_active")]
    pub state: PortState,
    #[serde(default)]
    pub mtu: Mtu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FabricConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkEnd {
    pub device: String,
    pub port: u8,
}

/// A responder and an initiator connected to each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    pub server: LinkEnd,
    pub client: LinkEnd,
    /// Size in bytes of the remotely writable buffer prepared on the server side.
    pub rmb_size: Option<usize>,
}

/// A port state change replayed after the links are up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventConfig {
    pub device: String,
    pub port: u8,
    pub state: PortState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub tracing: TracingConfig,
    #[serde(default)]
    pub fabric: FabricConfig,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}
