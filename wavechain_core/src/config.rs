/// Chain topology file support
///
/// Maps node names to their address, listen port and next hop. Loaded from
/// TOML or YAML (auto-detected), with the same standard search paths as the
/// other wavechain tools.
use crate::communication::relay_buffer::OverflowPolicy;
use crate::error::{WaveError, WaveResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What starts a node's processing cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Starts cycles itself by collecting from its port
    Sensing,
    /// Starts cycles when an envelope arrives
    #[default]
    Relay,
}

/// One entry of the topology table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Host name or IP the node listens on
    pub address: String,

    pub port: u16,

    /// Name of the next hop; absent for the terminal node
    #[serde(default)]
    pub destination: Option<String>,

    #[serde(default)]
    pub role: NodeRole,

    #[serde(default)]
    pub mac: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

/// Resolved network location of a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    /// `host:port` string accepted by `TcpStream::connect`
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.address, self.port)
    }
}

/// Identity of the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub destination: Option<String>,
    pub role: NodeRole,
}

impl NodeIdentity {
    pub fn is_terminal(&self) -> bool {
        self.destination.is_none()
    }
}

/// Longest cooldown, ready timeout or round trip a topology file may set
pub const MAX_SETTING_SECS: f64 = 7.0 * 24.0 * 3600.0;

fn default_cooldown_secs() -> f64 {
    30.0
}

fn default_relay_capacity() -> usize {
    6
}

fn default_ready_timeout_secs() -> Option<f64> {
    Some(120.0)
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Runtime knobs shared by every node of the chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Rest period after a forward before new envelopes are admitted
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f64,

    #[serde(default = "default_relay_capacity")]
    pub relay_capacity: usize,

    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// How long a feeder waits for `ready_signal`; null or 0 waits forever
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: Option<f64>,

    /// Upper bound on one request/response round trip
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Interface the node server binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            relay_capacity: default_relay_capacity(),
            overflow_policy: OverflowPolicy::default(),
            ready_timeout_secs: default_ready_timeout_secs(),
            io_timeout_ms: default_io_timeout_ms(),
            bind_address: default_bind_address(),
        }
    }
}

fn setting_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_SETTING_SECS)).unwrap_or_default()
}

fn check_secs(field: &str, secs: f64) -> WaveResult<()> {
    if !(0.0..=MAX_SETTING_SECS).contains(&secs) {
        return Err(WaveError::config(format!(
            "{} must be between 0 and {} seconds, got {}",
            field, MAX_SETTING_SECS, secs
        )));
    }
    Ok(())
}

impl ChainSettings {
    pub fn cooldown(&self) -> Duration {
        setting_secs(self.cooldown_secs)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_secs
            .filter(|secs| *secs > 0.0)
            .map(setting_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.min(MAX_SETTING_SECS as u64 * 1000))
    }

    /// Reject values that cannot be turned into a usable duration
    pub fn validate(&self) -> WaveResult<()> {
        check_secs("cooldown_secs", self.cooldown_secs)?;
        if let Some(secs) = self.ready_timeout_secs {
            check_secs("ready_timeout_secs", secs)?;
        }
        if self.io_timeout_ms == 0 {
            return Err(WaveError::config("io_timeout_ms must be positive"));
        }
        check_secs("io_timeout_ms", self.io_timeout_ms as f64 / 1000.0)?;
        Ok(())
    }
}

/// Full topology file: node table plus shared settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainTopology {
    pub nodes: BTreeMap<String, NodeEntry>,

    #[serde(default)]
    pub settings: ChainSettings,
}

impl ChainTopology {
    /// Load topology from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> WaveResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WaveError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => {
                let topology: Self = match toml::from_str(&contents) {
                    Ok(topology) => topology,
                    Err(_) => serde_yaml::from_str(&contents)?,
                };
                topology.settings.validate()?;
                Ok(topology)
            }
        }
    }

    pub fn from_toml(contents: &str) -> WaveResult<Self> {
        let topology: Self = toml::from_str(contents)?;
        topology.settings.validate()?;
        Ok(topology)
    }

    pub fn from_yaml(contents: &str) -> WaveResult<Self> {
        let topology: Self = serde_yaml::from_str(contents)?;
        topology.settings.validate()?;
        Ok(topology)
    }

    /// Find and load a topology file from the standard search paths
    ///
    /// Search order:
    /// 1. ./wavechain.yaml, ./wavechain.yml, ./wavechain.toml
    /// 2. ./config/controllers.yaml
    /// 3. ~/.wavechain/config.yaml or ~/.wavechain/config.toml
    pub fn find_and_load() -> WaveResult<Self> {
        for path in Self::get_search_paths() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(WaveError::config(
            "No topology file found in standard locations",
        ))
    }

    pub fn get_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("wavechain.yaml"),
            PathBuf::from("wavechain.yml"),
            PathBuf::from("wavechain.toml"),
            PathBuf::from("config").join("controllers.yaml"),
        ];

        if let Some(home) = dirs::home_dir() {
            let dir = home.join(".wavechain");
            paths.push(dir.join("config.yaml"));
            paths.push(dir.join("config.toml"));
        }

        paths
    }

    pub fn entry(&self, name: &str) -> WaveResult<&NodeEntry> {
        self.nodes.get(name).ok_or_else(|| {
            WaveError::configuration(format!("Node '{}' not found in topology", name))
        })
    }

    pub fn identity(&self, name: &str) -> WaveResult<NodeIdentity> {
        let entry = self.entry(name)?;
        Ok(NodeIdentity {
            name: name.to_string(),
            address: entry.address.clone(),
            port: entry.port,
            destination: entry.destination.clone(),
            role: entry.role,
        })
    }

    pub fn peer(&self, name: &str) -> WaveResult<PeerAddress> {
        let entry = self.entry(name)?;
        Ok(PeerAddress::new(name, entry.address.clone(), entry.port))
    }

    /// Resolve the configured next hop of `name`; `None` for a terminal node
    pub fn next_hop(&self, name: &str) -> WaveResult<Option<PeerAddress>> {
        match &self.entry(name)?.destination {
            None => Ok(None),
            Some(dest) => self.peer(dest).map(Some).map_err(|_| {
                WaveError::configuration(format!(
                    "Destination '{}' of node '{}' is not in the topology",
                    dest, name
                ))
            }),
        }
    }

    /// Destinations that point at unknown nodes, as `(node, destination)`
    pub fn dangling_routes(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .filter_map(|(name, entry)| {
                entry
                    .destination
                    .as_ref()
                    .filter(|dest| !self.nodes.contains_key(*dest))
                    .map(|dest| (name.clone(), dest.clone()))
            })
            .collect()
    }
}
