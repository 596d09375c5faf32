//! Bech32 account addresses.
//!
//! An address is the bech32 rendering (HRP `ocn`) of the first 20 bytes of
//! SHA-256 over an Ed25519 public key. Inside consensus objects an address
//! travels as its UTF-8 string bytes and is ordered as a byte string.

use std::fmt;

use bech32::{Bech32, Hrp};
use serde::{Deserialize, Serialize};

use super::CryptoError;
use crate::codec::CodecError;
use crate::constants::{ADDRESS_HASH_SIZE, ADDRESS_HRP};

/// A bech32-encoded account identifier.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address(String);

impl Address {
    /// Derive an address from an Ed25519 public key.
    pub fn from_pubkey(pubkey: &[u8]) -> Result<Self, CryptoError> {
        if pubkey.is_empty() {
            return Err(CryptoError::EmptyPublicKey);
        }
        let digest = crate::sha256(pubkey);
        let hrp = Hrp::parse(ADDRESS_HRP).map_err(|e| CryptoError::Bech32(e.to_string()))?;
        let encoded = bech32::encode::<Bech32>(hrp, &digest[..ADDRESS_HASH_SIZE])
            .map_err(|e| CryptoError::Bech32(e.to_string()))?;
        Ok(Address(encoded))
    }

    /// Parse and validate a bech32 address string.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        Self::decode(s)?;
        Ok(Address(s.to_string()))
    }

    /// Decode a bech32 address to its 20-byte digest.
    pub fn decode(s: &str) -> Result<Vec<u8>, CryptoError> {
        let (hrp, data) = bech32::decode(s).map_err(|e| CryptoError::Bech32(e.to_string()))?;
        if hrp.as_str() != ADDRESS_HRP {
            return Err(CryptoError::InvalidHrp(hrp.as_str().to_string()));
        }
        if data.len() != ADDRESS_HASH_SIZE {
            return Err(CryptoError::InvalidAddressLength(data.len()));
        }
        Ok(data)
    }

    /// Construct an address from wire bytes. Wire addresses are opaque byte
    /// strings; bech32 validity is not consensus, ordering is.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, CodecError> {
        let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8("address"))?;
        Ok(Address(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical wire bytes of the address.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_and_decode_roundtrip() {
        let pubkey = [7u8; 32];
        let addr = Address::from_pubkey(&pubkey).unwrap();
        assert!(addr.as_str().starts_with("ocn1"));

        let digest = Address::decode(addr.as_str()).unwrap();
        assert_eq!(digest.len(), ADDRESS_HASH_SIZE);
        assert_eq!(&digest[..], &crate::sha256(&pubkey)[..ADDRESS_HASH_SIZE]);
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = Address::from_pubkey(&[1u8; 32]).unwrap();
        let b = Address::from_pubkey(&[1u8; 32]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Address::from_pubkey(&[2u8; 32]).unwrap());
    }

    #[test]
    fn empty_pubkey_rejected() {
        assert!(matches!(
            Address::from_pubkey(&[]),
            Err(CryptoError::EmptyPublicKey)
        ));
    }

    #[test]
    fn wrong_hrp_rejected() {
        // A valid bech32 string with a different prefix.
        let hrp = Hrp::parse("btc").unwrap();
        let other = bech32::encode::<Bech32>(hrp, &[0u8; 20]).unwrap();
        assert!(matches!(
            Address::decode(&other),
            Err(CryptoError::InvalidHrp(_))
        ));
    }

    #[test]
    fn ordering_is_byte_order() {
        let mut addrs: Vec<Address> = (0u8..4)
            .map(|i| Address::from_pubkey(&[i; 32]).unwrap())
            .collect();
        addrs.sort();
        for pair in addrs.windows(2) {
            assert!(pair[0].as_bytes() <= pair[1].as_bytes());
        }
    }
}
