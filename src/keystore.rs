//! Keystore (spec §4.5, §6): loads or generates, at first start, the three
//! persistent blobs under `keystore_dir` with `0600` permissions:
//! the ECDSA/Schnorr private scalar, the Ed25519 seed, and the macaroon root
//! secret. Never logged; never rewritten except on first generation.
//!
//! Mirrors the teacher's "global mutable singletons → explicit service object
//! constructed once at boot and threaded through request handling" design
//! note: a `Keystore` is built once in `main` and held behind an `Arc`.

use ed25519_dalek::SigningKey as Ed25519SigningKey;
use rand::RngCore;
use secp256k1::{Secp256k1, SecretKey};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const ECDSA_KEY_FILE: &str = "ecdsa.key";
const ED25519_KEY_FILE: &str = "ed25519.key";
const MACAROON_ROOT_FILE: &str = "macaroon_root.key";

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("failed to read/write keystore file {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("corrupt key material in {0:?}: expected {1} bytes, found {2}")]
    WrongLength(PathBuf, usize, usize),
    #[error("invalid secp256k1 scalar: {0}")]
    InvalidScalar(#[from] secp256k1::Error),
}

pub struct Keystore {
    pub secp: Secp256k1<secp256k1::All>,
    pub ecdsa_secret: SecretKey,
    pub ed25519_signing_key: Ed25519SigningKey,
    pub macaroon_root_secret: [u8; 32],
}

impl Keystore {
    /// Loads the three blobs from `dir`, generating and persisting any that
    /// are absent. Creates `dir` if it doesn't exist.
    pub fn load_or_generate(dir: &Path) -> Result<Self, KeystoreError> {
        fs::create_dir_all(dir).map_err(|e| KeystoreError::Io(dir.to_path_buf(), e))?;

        let secp = Secp256k1::new();
        let ecdsa_bytes = load_or_generate_32(&dir.join(ECDSA_KEY_FILE))?;
        let ecdsa_secret = SecretKey::from_slice(&ecdsa_bytes)?;

        let ed25519_bytes = load_or_generate_32(&dir.join(ED25519_KEY_FILE))?;
        let ed25519_signing_key = Ed25519SigningKey::from_bytes(&ed25519_bytes);

        let macaroon_root_secret = load_or_generate_32(&dir.join(MACAROON_ROOT_FILE))?;

        Ok(Keystore {
            secp,
            ecdsa_secret,
            ed25519_signing_key,
            macaroon_root_secret,
        })
    }
}

/// Reads a 32-byte secret from `path`, or generates and persists a fresh one
/// with `0600` permissions if the file doesn't exist yet.
fn load_or_generate_32(path: &Path) -> Result<[u8; 32], KeystoreError> {
    if path.exists() {
        let bytes = fs::read(path).map_err(|e| KeystoreError::Io(path.to_path_buf(), e))?;
        if bytes.len() != 32 {
            return Err(KeystoreError::WrongLength(path.to_path_buf(), 32, bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    } else {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        fs::write(path, bytes).map_err(|e| KeystoreError::Io(path.to_path_buf(), e))?;
        let mut perms = fs::metadata(path)
            .map_err(|e| KeystoreError::Io(path.to_path_buf(), e))?
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms).map_err(|e| KeystoreError::Io(path.to_path_buf(), e))?;
        tracing::info!(path = %path.display(), "generated new key material");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_then_reloads_identical_material() {
        let dir = TempDir::new().unwrap();
        let first = Keystore::load_or_generate(dir.path()).unwrap();
        let second = Keystore::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.ecdsa_secret.secret_bytes(), second.ecdsa_secret.secret_bytes());
        assert_eq!(
            first.ed25519_signing_key.to_bytes(),
            second.ed25519_signing_key.to_bytes()
        );
        assert_eq!(first.macaroon_root_secret, second.macaroon_root_secret);
    }

    #[test]
    fn persists_key_file_with_restrictive_permissions() {
        let dir = TempDir::new().unwrap();
        let _ = Keystore::load_or_generate(dir.path()).unwrap();
        let meta = fs::metadata(dir.path().join(ECDSA_KEY_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
