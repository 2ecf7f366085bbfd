//! Server identity.
//!
//! Each server owns a long-lived ed25519 key pair. The base64-encoded public
//! key is the stable `server_id` used in the hash ring, bootstrap registry,
//! and federation handshakes. A fresh `node_id` is generated per process so
//! restarts are distinguishable.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;

/// Long-lived server identity plus per-process node ID.
pub struct ServerIdentity {
    signing_key: SigningKey,
    /// Base64 of the 32-byte public key. Stable across restarts.
    pub server_id: String,
    /// Random per-process ID. Distinguishes restarts in the ring.
    pub node_id: String,
}

impl ServerIdentity {
    /// Load the identity key from `path`, generating and persisting a new
    /// one on first start.
    pub fn load_or_generate(path: &Path) -> std::io::Result<Self> {
        let signing_key = if path.exists() {
            let bytes = std::fs::read(path)?;
            let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("identity key at {} is not 32 bytes", path.display()),
                )
            })?;
            SigningKey::from_bytes(&seed)
        } else {
            let mut seed = [0u8; 32];
            OsRng.fill_bytes(&mut seed);
            let key = SigningKey::from_bytes(&seed);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, key.to_bytes())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }
            tracing::info!(path = %path.display(), "Generated new server identity key");
            key
        };

        Ok(Self::from_signing_key(signing_key))
    }

    /// Build an identity from an existing key (used by tests).
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let server_id = BASE64.encode(signing_key.verifying_key().as_bytes());
        let node_id = uuid::Uuid::new_v4().to_string();
        Self {
            signing_key,
            server_id,
            node_id,
        }
    }

    /// Generate a throwaway identity without touching disk.
    pub fn ephemeral() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    /// Base64 public key, identical to `server_id`.
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_identity_has_valid_server_id() {
        let id = ServerIdentity::ephemeral();
        let decoded = BASE64.decode(&id.server_id).unwrap();
        assert_eq!(decoded.len(), 32);
        assert_eq!(id.server_id, id.public_key_b64());
    }

    #[test]
    fn test_node_id_differs_per_instance() {
        let a = ServerIdentity::ephemeral();
        let b = ServerIdentity::ephemeral();
        assert_ne!(a.node_id, b.node_id);
    }

    #[test]
    fn test_load_or_generate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let first = ServerIdentity::load_or_generate(&path).unwrap();
        assert!(path.exists());

        let second = ServerIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.server_id, second.server_id);
        assert_ne!(first.node_id, second.node_id);
    }
}
