//! Genesis file: the initial chain configuration, validated before a node
//! will start from it.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{Address, CryptoError};
use crate::rc;

const MIN_STAKE_FLOOR: u64 = 1_000_000;
const MIN_STAKE_CEILING: u64 = 1_000_000_000_000_000_000;

/// Initial chain configuration (`genesis.json`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Genesis {
    pub chain_id: String,
    /// RFC 3339 UTC timestamp; seeds the timestamp window.
    pub genesis_time: DateTime<Utc>,
    pub rc_params: rc::Params,
    pub min_validator_stake: u64,
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: Address,
    #[serde(with = "hex_bytes")]
    pub consensus_pubkey: Vec<u8>,
    pub stake: u64,
    #[serde(default)]
    pub commission: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: Address,
    #[serde(default)]
    pub balance: u64,
    #[serde(default)]
    pub stake: u64,
}

/// Errors from genesis loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("chain_id required")]
    MissingChainId,
    #[error(transparent)]
    RcParams(#[from] rc::ParamsError),
    #[error("min_validator_stake out of bounds")]
    MinStakeOutOfBounds,
    #[error("validator stake below minimum")]
    ValidatorStakeBelowMinimum,
    #[error("validator missing consensus public key")]
    MissingValidatorPubKey,
    #[error("validator address derivation failed: {0}")]
    AddressDerivation(String),
    #[error("validator address does not match public key")]
    ValidatorAddressMismatch,
    #[error("genesis I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("genesis encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Genesis {
    /// A default genesis with sane RC parameters and no participants.
    pub fn default_with_chain_id(chain_id: &str) -> Self {
        Genesis {
            chain_id: chain_id.to_string(),
            genesis_time: Utc::now(),
            rc_params: rc::Params {
                alpha: 1000,
                beta: 1,
                c_size: 1,
                c_compute: 1,
                c_storage: 50,
                max_skew_sec: 30,
                window_n: 11,
            },
            min_validator_stake: MIN_STAKE_FLOOR,
            validators: Vec::new(),
            accounts: Vec::new(),
        }
    }

    /// Validate parameter bounds and every validator entry.
    pub fn validate(&self) -> Result<(), GenesisError> {
        if self.chain_id.is_empty() {
            return Err(GenesisError::MissingChainId);
        }
        self.rc_params.validate_genesis()?;
        if !(MIN_STAKE_FLOOR..=MIN_STAKE_CEILING).contains(&self.min_validator_stake) {
            return Err(GenesisError::MinStakeOutOfBounds);
        }
        for v in &self.validators {
            if v.stake < self.min_validator_stake {
                return Err(GenesisError::ValidatorStakeBelowMinimum);
            }
            if v.consensus_pubkey.is_empty() {
                return Err(GenesisError::MissingValidatorPubKey);
            }
            let derived = Address::from_pubkey(&v.consensus_pubkey)
                .map_err(|e: CryptoError| GenesisError::AddressDerivation(e.to_string()))?;
            if derived != v.address {
                return Err(GenesisError::ValidatorAddressMismatch);
            }
        }
        Ok(())
    }

    /// Validate and write the genesis file.
    pub fn save(&self, path: &Path) -> Result<(), GenesisError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Read and validate a genesis file.
    pub fn load(path: &Path) -> Result<Self, GenesisError> {
        let data = std::fs::read(path)?;
        let genesis: Genesis = serde_json::from_slice(&data)?;
        genesis.validate()?;
        Ok(genesis)
    }
}

/// Hex (de)serialization for byte fields in JSON.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
