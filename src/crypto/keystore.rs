//! On-disk keystore: a JSON file holding a base64 keypair, written with
//! owner-only permissions.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use super::{CryptoError, Keypair};

#[derive(Serialize, Deserialize)]
struct KeyFile {
    public_key: String,
    private_key: String,
}

/// Persist a keypair to `path` as JSON with mode 0600.
pub fn save_keypair(path: &Path, kp: &Keypair) -> Result<(), CryptoError> {
    let data = KeyFile {
        public_key: BASE64.encode(kp.public_key()),
        private_key: BASE64.encode(kp.seed()),
    };
    let raw = serde_json::to_vec_pretty(&data)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, raw)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Load a keypair previously written by [`save_keypair`].
pub fn load_keypair(path: &Path) -> Result<Keypair, CryptoError> {
    let raw = std::fs::read(path)?;
    let data: KeyFile = serde_json::from_slice(&raw)?;
    let seed_bytes = BASE64
        .decode(&data.private_key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    let seed: [u8; 32] = seed_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyMaterial("private key must be 32 bytes".into()))?;
    let kp = Keypair::from_seed(&seed);

    let public = BASE64
        .decode(&data.public_key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    if public != kp.public_key() {
        return Err(CryptoError::InvalidKeyMaterial(
            "public key does not match private key".into(),
        ));
    }
    Ok(kp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validator_key.json");
        let kp = Keypair::generate();

        save_keypair(&path, &kp).unwrap();
        let loaded = load_keypair(&path).unwrap();
        assert_eq!(kp.public_key(), loaded.public_key());
    }

    #[test]
    fn tampered_public_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        let kp = Keypair::generate();
        save_keypair(&path, &kp).unwrap();

        let mut file: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        file["public_key"] = serde_json::Value::String(BASE64.encode([1u8; 32]));
        std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

        assert!(load_keypair(&path).is_err());
    }

    #[test]
    fn missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_keypair(&dir.path().join("nope.json")).is_err());
    }
}
