//! Node configuration (`ocean.toml`).
//!
//! Loaded from the home directory; CLI flags override config file values,
//! and a missing or malformed file falls back to defaults.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CHAIN_ID, DEFAULT_P2P_PORT, DEFAULT_RPC_PORT};

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OceanConfig {
    pub node: NodeSection,
    pub consensus: ConsensusSection,
    pub governance: crate::governance::Params,
}

/// Node section: identity, listen addresses, peers, validator key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub moniker: String,
    pub chain_id: String,
    pub p2p_host: String,
    pub p2p_port: u16,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub bootstrap_peers: Vec<String>,
    pub validator_enabled: bool,
    pub validator_key_file: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            moniker: "ocean-node".into(),
            chain_id: DEFAULT_CHAIN_ID.into(),
            p2p_host: "0.0.0.0".into(),
            p2p_port: DEFAULT_P2P_PORT,
            rpc_host: "127.0.0.1".into(),
            rpc_port: DEFAULT_RPC_PORT,
            bootstrap_peers: vec![],
            validator_enabled: false,
            validator_key_file: "config/validator_key.json".into(),
        }
    }
}

/// Consensus section: staking bounds, slashing, timers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    pub min_stake: u64,
    pub max_validators: u32,
    pub epoch_length: u64,
    pub block_max_txs: usize,
    pub slash_double_bps: u64,
    pub jail_double_epochs: u64,
    pub slash_offline_bps: u64,
    pub jail_offline_epochs: u64,
    /// Interval between propose attempts, in milliseconds.
    pub propose_interval_ms: u64,
    /// Round timeout driving view change, in milliseconds.
    pub round_timeout_ms: u64,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        ConsensusSection {
            min_stake: 1_000_000,
            max_validators: 100,
            epoch_length: 10_000,
            block_max_txs: crate::constants::BLOCK_MAX_TXS,
            slash_double_bps: 500,
            jail_double_epochs: 10,
            slash_offline_bps: 10,
            jail_offline_epochs: 2,
            propose_interval_ms: 1_000,
            round_timeout_ms: 3_000,
        }
    }
}

impl OceanConfig {
    /// Load `ocean.toml` from the home directory, falling back to defaults
    /// when the file is missing or malformed.
    pub fn load(home: &Path) -> Self {
        let config_path = home.join("ocean.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Write the configuration to `ocean.toml` in the home directory.
    pub fn save(&self, home: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(home)?;
        let contents = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(home.join("ocean.toml"), contents)
    }

    pub fn p2p_listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.node.p2p_host, self.node.p2p_port).parse()
    }

    pub fn rpc_listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.node.rpc_host, self.node.rpc_port).parse()
    }

    /// Parse bootstrap peers, dropping entries that are not socket addresses.
    pub fn parse_bootstrap_peers(&self) -> Vec<SocketAddr> {
        self.node
            .bootstrap_peers
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    /// Consensus parameters for the BFT engine.
    pub fn consensus_config(&self) -> crate::consensus::Config {
        crate::consensus::Config {
            epoch_length: self.consensus.epoch_length,
            max_validators: self.consensus.max_validators,
            block_max_txs: self.consensus.block_max_txs,
            min_stake: self.consensus.min_stake,
            slash_double_bps: self.consensus.slash_double_bps,
            jail_double_epochs: self.consensus.jail_double_epochs,
            slash_offline_bps: self.consensus.slash_offline_bps,
            jail_offline_epochs: self.consensus.jail_offline_epochs,
        }
    }
}
