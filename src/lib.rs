//! # Ocean
//!
//! A permissioned, gas-less delegated-proof-of-stake blockchain node with:
//! - **BFT finality** — leader-based single-round precommit voting with
//!   quorum certificates and view change; no probabilistic forks
//! - **Resource Credits** — no transaction fees; each account holds a
//!   regenerating, stake-proportional RC capacity consumed by transactions
//! - **Deterministic state machine** — canonical wire encoding, Merkle state
//!   roots, and speculative block preview shared by every honest node
//! - **DPoS validator set** — stake-weighted registration, delegation, and
//!   slashing with power-then-address ordering
//! - **WASM contracts** — bounded, deterministic contract hosting with
//!   consensus-critical cost estimates

pub mod block;
pub mod codec;
pub mod config;
pub mod consensus;
pub mod contracts;
pub mod crypto;
pub mod genesis;
pub mod governance;
pub mod mempool;
pub mod node;
pub mod p2p;
pub mod rc;
pub mod rpc;
pub mod state;
pub mod transaction;

/// Protocol constants
pub mod constants {
    /// Human-readable prefix for bech32 account addresses
    pub const ADDRESS_HRP: &str = "ocn";
    /// Number of digest bytes used for an address (first 20 of SHA-256)
    pub const ADDRESS_HASH_SIZE: usize = 20;
    /// Default chain identifier
    pub const DEFAULT_CHAIN_ID: &str = "ocean-1";
    /// Default P2P listen port
    pub const DEFAULT_P2P_PORT: u16 = 26656;
    /// Default RPC listen port
    pub const DEFAULT_RPC_PORT: u16 = 26657;
    /// Maximum transactions drained from the mempool per proposed block
    pub const BLOCK_MAX_TXS: usize = 1_000;
    /// Maximum P2P message size (1 MiB)
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 1024 * 1024;
    /// Ed25519 public key length in bytes
    pub const PUBKEY_LEN: usize = 32;
    /// Ed25519 signature length in bytes
    pub const SIGNATURE_LEN: usize = 64;
}

/// 32-byte SHA-256 hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute the SHA-256 hash of the input.
pub fn sha256(data: &[u8]) -> Hash {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Render a hash as lowercase hex for logs and RPC responses.
pub fn hash_hex(h: &Hash) -> String {
    hex::encode(h)
}
