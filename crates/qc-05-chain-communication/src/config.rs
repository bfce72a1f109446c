//! # Chain Communication Configuration
//!
//! Boot environment, chain parameters, node identity and timing knobs.
//!
//! The configuration is built once at startup and injected as
//! `Arc<ChainCommConfig>`; nothing reads process-wide state after that.
//!
//! ## Sources
//!
//! - Defaults per [`BootEnv`] (selected by the `boots_env` variable)
//! - Optional TOML file ([`ChainCommConfig::load`])
//! - Optional `static_boot_nodes.json` / `static_verifier_boot_nodes.json`
//!   in the data directory ([`ChainCommConfig::load_static_nodes`])

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared_types::{NodeType, U256};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{NodeUrl, SelfRole, P2P_MAX_PEER_COUNT, PBFT_MAX_PEER_COUNT};

/// Environment variable selecting the boot environment.
pub const BOOT_ENV_VAR: &str = "boots_env";

pub const STATIC_BOOT_NODES_FILE: &str = "static_boot_nodes.json";
pub const STATIC_VERIFIER_BOOT_NODES_FILE: &str = "static_verifier_boot_nodes.json";

/// Version of the chain-sync protocol carried in the handshake.
pub const CS_PROTOCOL_VERSION: u32 = 1;

/// Message-code space reserved by the chain-sync protocol.
pub const CS_PROTOCOL_LENGTH: u64 = 0x200;

pub const MINE_PROTOCOL_NAME: &str = "dipperin_mine";
pub const MINE_PROTOCOL_VERSION: u32 = 1;

const TEST_SERVER: &str = "172.16.5.201";
const LOCAL_VERIFIER_BOOT_PORT: u16 = 10000;

const TEST_VERIFIER_BOOT_IDS: [(&str, u16); 4] = [
    ("b832f4f2fe19dbc5604766bbb268a6d0f7ce9ce381b034b262a92f0ad8283a1b5fa058dea5269b66fbb2014a24fa7198c6dc2d8c9cbac7a348258fc20702561f", 10003),
    ("199cc6526cb63866dfa5dc81aed9952f2002b677560b6f3dc2a6a34a5576216f0ca25711c5b4268444fdef5fee4a01a669af90fd5b6049b2a5272b39c466b2ac", 10006),
    ("71112a581231af08a63d5a9079ea8dd690efd992f2cfbf98ad43697345de564441406133247d19c754c98051c64909c40db15094770a881a373ca1ff2f20bea2", 10009),
    ("07f3fdca9a07b048ea7d0cb642f69004e4fa5dd390888a9bb3e9fc382697c3634280cc8d327703b872d3711462da4aca96ee805069510375e7be2aded3dc5ad6", 10012),
];

const KBUCKET_BOOT_ID: &str = "e53903ee0001e81f9328c8d0929cedbaf9b4f5b65b536df5f5dd65e5aa650cc059976250d6fcc62685e46e035b52e22801e97b06bc84d8fc4848037c128a7b22";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid boot node url: {0}")]
    InvalidBootNode(String),

    #[error("invalid self node url: {0}")]
    InvalidNodeUrl(String),

    #[error("config io error: {0}")]
    Io(String),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("verifier boot node is not listed in the verifier boot set")]
    SelfNotInVerifierBoots,

    #[error("node type {0:?} cannot run the chain-sync protocol")]
    UnsupportedNodeType(NodeType),

    #[error("max peers {max_peers} is below the verifier reserve {reserved}")]
    MaxPeersTooSmall { max_peers: usize, reserved: usize },
}

// =============================================================================
// BOOT ENVIRONMENT
// =============================================================================

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootEnv {
    Mercury,
    Venus,
    Test,
    #[default]
    Local,
}

impl BootEnv {
    /// Read `boots_env`; absent or unknown values select `Local`.
    pub fn from_env() -> Self {
        std::env::var(BOOT_ENV_VAR)
            .map(|tag| Self::from_tag(&tag))
            .unwrap_or_default()
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "mercury" => BootEnv::Mercury,
            "venus" => BootEnv::Venus,
            "test" => BootEnv::Test,
            _ => BootEnv::Local,
        }
    }

    /// Name under which the chain-sync protocol is advertised.
    pub fn cs_protocol_name(self) -> &'static str {
        match self {
            BootEnv::Mercury => "dipperin_cs",
            BootEnv::Test => "dipperin_cs_test",
            BootEnv::Venus => "dipperin_vs",
            BootEnv::Local => "dipperin_cs_local",
        }
    }

    /// Built-in verifier-boot contact URLs.
    pub fn default_verifier_boot_nodes(self) -> Vec<String> {
        match self {
            BootEnv::Test => TEST_VERIFIER_BOOT_IDS
                .iter()
                .map(|(id, port)| format!("enode://{}@{}:{}", id, TEST_SERVER, port))
                .collect(),
            BootEnv::Local => vec![format!(
                "enode://{}@127.0.0.1:{}",
                TEST_VERIFIER_BOOT_IDS[0].0, LOCAL_VERIFIER_BOOT_PORT
            )],
            BootEnv::Mercury | BootEnv::Venus => Vec::new(),
        }
    }

    /// Built-in discovery boot contact URLs.
    pub fn default_boot_nodes(self) -> Vec<String> {
        match self {
            BootEnv::Test => vec![format!("enode://{}@{}:30301", KBUCKET_BOOT_ID, TEST_SERVER)],
            BootEnv::Local => vec![format!("enode://{}@127.0.0.1:30301", KBUCKET_BOOT_ID)],
            BootEnv::Mercury | BootEnv::Venus => Vec::new(),
        }
    }
}

// =============================================================================
// CHAIN PARAMETERS
// =============================================================================

/// Chain identity and committee sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub chain_id: U256,
    pub network_id: u64,
    /// Verifiers per slot.
    pub verifier_number: usize,
    /// Verifier-boot nodes expected in the network.
    pub verifier_boot_node_number: usize,
    pub protocol_version: u32,
}

impl ChainParams {
    pub fn for_env(env: BootEnv) -> Self {
        let (network_id, chain_id, verifier_number) = match env {
            BootEnv::Mercury => (99, 1, 22),
            BootEnv::Venus => (100, 2, 22),
            BootEnv::Test => (1600, 1600, 22),
            BootEnv::Local => (1601, 1601, 4),
        };
        Self {
            chain_id: U256::from(chain_id as u64),
            network_id,
            verifier_number,
            verifier_boot_node_number: 4,
            protocol_version: CS_PROTOCOL_VERSION,
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::for_env(BootEnv::Local)
    }
}

// =============================================================================
// NODE
// =============================================================================

/// Identity of the local node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub node_type: NodeType,
    pub node_name: String,
    /// Contact URL of the local node, `enode://<id>@<host>:<port>`.
    pub node_url: String,
    pub max_peers: usize,
    pub data_dir: PathBuf,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_type: NodeType::Normal,
            node_name: "quantum-node".to_string(),
            node_url: String::new(),
            max_peers: P2P_MAX_PEER_COUNT,
            data_dir: PathBuf::from("./data"),
        }
    }
}

// =============================================================================
// TIMING
// =============================================================================

/// Block fetcher DOS limits and timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Outstanding announcements allowed per peer.
    pub hash_limit: usize,
    /// Delivered bundles queued per peer.
    pub block_limit: usize,
    /// Announcements further than this above the local head are dropped.
    pub max_queue_dist: u64,
    pub arrive_timeout_ms: u64,
    pub gather_slack_ms: u64,
    pub fetch_timeout_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            hash_limit: 256,
            block_limit: 64,
            max_queue_dist: 32,
            arrive_timeout_ms: 500,
            gather_slack_ms: 100,
            fetch_timeout_ms: 5_000,
        }
    }
}

impl FetcherConfig {
    pub fn arrive_timeout(&self) -> Duration {
        Duration::from_millis(self.arrive_timeout_ms)
    }

    pub fn gather_slack(&self) -> Duration {
        Duration::from_millis(self.gather_slack_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Periods of the background loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub downloader_poll_secs: u64,
    /// Per-batch delivery timeout of a downloader session.
    pub fetch_block_timeout_secs: u64,
    pub verifier_boot_reconnect_secs: u64,
    /// Per-boot-node response timeout of the verifier finder.
    pub verifier_finder_timeout_secs: u64,
    pub peer_health_log_secs: u64,
    pub handshake_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            downloader_poll_secs: 10,
            fetch_block_timeout_secs: 60,
            verifier_boot_reconnect_secs: 8,
            verifier_finder_timeout_secs: 15,
            peer_health_log_secs: 15,
            handshake_timeout_secs: 5,
        }
    }
}

impl SyncConfig {
    pub fn downloader_poll(&self) -> Duration {
        Duration::from_secs(self.downloader_poll_secs)
    }

    pub fn fetch_block_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_block_timeout_secs)
    }

    pub fn verifier_boot_reconnect(&self) -> Duration {
        Duration::from_secs(self.verifier_boot_reconnect_secs)
    }

    pub fn verifier_finder_timeout(&self) -> Duration {
        Duration::from_secs(self.verifier_finder_timeout_secs)
    }

    pub fn peer_health_log(&self) -> Duration {
        Duration::from_secs(self.peer_health_log_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// =============================================================================
// ROOT
// =============================================================================

/// Complete configuration of the chain-communication core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainCommConfig {
    pub boot_env: BootEnv,
    pub verifier_boot_nodes: Vec<String>,
    pub boot_nodes: Vec<String>,
    pub chain: ChainParams,
    pub node: NodeSettings,
    pub fetcher: FetcherConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

impl Default for ChainCommConfig {
    fn default() -> Self {
        Self::for_env(BootEnv::Local)
    }
}

impl ChainCommConfig {
    /// Defaults for `env`.
    pub fn for_env(env: BootEnv) -> Self {
        Self {
            boot_env: env,
            verifier_boot_nodes: env.default_verifier_boot_nodes(),
            boot_nodes: env.default_boot_nodes(),
            chain: ChainParams::for_env(env),
            node: NodeSettings::default(),
            fetcher: FetcherConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Defaults for the environment named by `boots_env`.
    pub fn from_env() -> Self {
        Self::for_env(BootEnv::from_env())
    }

    /// Short timers and no static boot nodes.
    pub fn for_testing() -> Self {
        let mut config = Self::for_env(BootEnv::Local);
        config.verifier_boot_nodes.clear();
        config.boot_nodes.clear();
        config.sync = SyncConfig {
            downloader_poll_secs: 1,
            fetch_block_timeout_secs: 2,
            verifier_boot_reconnect_secs: 1,
            verifier_finder_timeout_secs: 1,
            peer_health_log_secs: 5,
            handshake_timeout_secs: 1,
        };
        config.logging.level = "debug".to_string();
        config
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Extend the boot lists with the static node files in the data dir.
    pub fn load_static_nodes(&mut self) -> Result<(), ConfigError> {
        let dir = self.node.data_dir.clone();
        for url in load_nodes_from_file(&dir.join(STATIC_VERIFIER_BOOT_NODES_FILE))? {
            if !self.verifier_boot_nodes.contains(&url) {
                self.verifier_boot_nodes.push(url);
            }
        }
        for url in load_nodes_from_file(&dir.join(STATIC_BOOT_NODES_FILE))? {
            if !self.boot_nodes.contains(&url) {
                self.boot_nodes.push(url);
            }
        }
        info!(
            env = ?self.boot_env,
            verifier_boots = self.verifier_boot_nodes.len(),
            boots = self.boot_nodes.len(),
            "boot nodes loaded"
        );
        Ok(())
    }

    pub fn cs_protocol_name(&self) -> &'static str {
        self.boot_env.cs_protocol_name()
    }

    /// Parsed local contact URL.
    pub fn self_node(&self) -> Result<NodeUrl, ConfigError> {
        NodeUrl::parse(&self.node.node_url)
            .map_err(|_| ConfigError::InvalidNodeUrl(self.node.node_url.clone()))
    }

    /// Parsed verifier-boot URLs.
    pub fn verifier_boot_urls(&self) -> Result<Vec<NodeUrl>, ConfigError> {
        self.verifier_boot_nodes
            .iter()
            .map(|raw| NodeUrl::parse(raw).map_err(|_| ConfigError::InvalidBootNode(raw.clone())))
            .collect()
    }

    /// Resolve the local role and validate the peer budget.
    pub fn self_role(&self) -> Result<SelfRole, ConfigError> {
        let self_id = match self.node.node_type {
            NodeType::VerifierBoot => self.self_node()?.id().to_string(),
            _ => String::new(),
        };
        let boots = self.verifier_boot_urls()?;
        let role = SelfRole::resolve(
            self.node.node_type,
            &self_id,
            boots.iter().map(|u| u.id()),
        )
        .ok_or(match self.node.node_type {
            NodeType::VerifierBoot => ConfigError::SelfNotInVerifierBoots,
            other => ConfigError::UnsupportedNodeType(other),
        })?;

        if role != SelfRole::Base && self.node.max_peers < PBFT_MAX_PEER_COUNT {
            return Err(ConfigError::MaxPeersTooSmall {
                max_peers: self.node.max_peers,
                reserved: PBFT_MAX_PEER_COUNT,
            });
        }
        Ok(role)
    }
}

/// Read a JSON array of node URLs. A missing file yields an empty list;
/// entries that do not parse are logged and skipped.
pub fn load_nodes_from_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ConfigError::Io(format!("{}: {}", path.display(), e))),
    };

    let entries: Vec<String> =
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;

    Ok(entries
        .into_iter()
        .filter(|entry| match NodeUrl::parse(entry) {
            Ok(_) => true,
            Err(_) => {
                warn!(entry = %entry, file = %path.display(), "skipping invalid node url");
                false
            }
        })
        .collect())
}
