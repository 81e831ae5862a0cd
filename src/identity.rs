//! Persistent Ed25519 keypair backing the manager's own TLS certificate.
//!
//! The manager's analyzer id is an operator-configured `u64` (see
//! [`crate::config::IdentityConfig`]); the keypair here only backs the
//! self-signed certificate the manager presents during the TLS handshake,
//! it is unrelated to analyzer identity.

use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tracing::{debug, info};
use zeroize::Zeroize;

/// A loaded or freshly generated Ed25519 signing key.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Load the raw 32-byte secret key from `path`, generating and
    /// persisting a new one if the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read identity key at {}", path.display()))?;
            let mut key_bytes: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .context("identity key file is not 32 bytes")?;
            let signing_key = SigningKey::from_bytes(&key_bytes);
            key_bytes.zeroize();
            debug!(path = %path.display(), "loaded manager TLS identity");
            Ok(Self { signing_key })
        } else {
            let identity = Self::generate();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create identity directory {}", parent.display())
                })?;
            }
            std::fs::write(path, identity.signing_key.to_bytes())
                .with_context(|| format!("failed to write identity key to {}", path.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                let _ = std::fs::set_permissions(path, perms);
            }
            info!(path = %path.display(), "generated new manager TLS identity");
            Ok(identity)
        }
    }

    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}
