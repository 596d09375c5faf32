//! Cryptographic primitives: Ed25519 signing keys, bech32 account addresses,
//! and the on-disk keystore.

pub mod address;
pub mod keys;
pub mod keystore;

pub use address::Address;
pub use keys::{verify, Keypair};

/// Errors from key handling and address derivation.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("empty public key")]
    EmptyPublicKey,
    #[error("invalid public key length {0}")]
    InvalidPublicKeyLength(usize),
    #[error("bech32 error: {0}")]
    Bech32(String),
    #[error("invalid address prefix: {0}")]
    InvalidHrp(String),
    #[error("invalid address payload length {0}")]
    InvalidAddressLength(usize),
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
    #[error("keystore I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("keystore encoding error: {0}")]
    Json(#[from] serde_json::Error),
}
