//! This service's own Ed25519 keypair.
//!
//! Used to sign gateway descriptors for spell chains and to register with
//! the discovery service. Requests from callers are never signed with it.

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

use crate::types::{ContinuebeeError, Result};

pub struct NodeKeys {
    signing_key: SigningKey,
}

impl NodeKeys {
    /// Generate a new keypair from the OS RNG
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load from a hex-encoded 32-byte seed
    pub fn from_seed_hex(seed: &str) -> Result<Self> {
        let bytes: [u8; 32] = hex::decode(seed.trim())
            .map_err(|e| ContinuebeeError::Config(format!("SIGNING_KEY is not hex: {}", e)))?
            .try_into()
            .map_err(|_| ContinuebeeError::Config("SIGNING_KEY must be 32 bytes".into()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Hex-encoded signature over the UTF-8 message
    pub fn sign(&self, message: &str) -> String {
        hex::encode(self.signing_key.sign(message.as_bytes()).to_bytes())
    }
}

impl std::fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeys")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}
