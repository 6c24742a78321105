//! Signature verification
//!
//! Every authenticated operation signs a plain concatenation of its fields.
//! The order is load-bearing: signer and verifier must build the exact
//! same string.
//!
//! | Operation  | Message                                |
//! |------------|----------------------------------------|
//! | create     | `timestamp + pubKey + hash`            |
//! | checkHash  | `timestamp + uuid + hash`              |
//! | updateHash | `timestamp + uuid + oldHash + newHash` |
//! | deleteUser | `timestamp + uuid + hash`              |
//! | gateway    | `timestamp + uuid + minimumCost + ordinal` |
//! | register   | `timestamp + pubKey`                   |

use ed25519_dalek::{Signature, VerifyingKey};
use tracing::debug;

use super::freshness::Timestamp;

/// Verifies a hex signature over a message for a hex public key.
///
/// Implementations must return `false` (never panic) for undecodable keys
/// or signatures.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signature: &str, message: &str, public_key: &str) -> bool;
}

/// Ed25519 verifier over hex-encoded keys and signatures
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, signature: &str, message: &str, public_key: &str) -> bool {
        let Some(key) = decode_public_key(public_key) else {
            debug!("Rejecting signature: undecodable public key");
            return false;
        };
        let Some(sig) = decode_signature(signature) else {
            debug!("Rejecting signature: undecodable signature");
            return false;
        };
        // Strict: rejects small-order keys and non-canonical signatures
        key.verify_strict(message.as_bytes(), &sig).is_ok()
    }
}

fn decode_public_key(hex_key: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(hex_key.trim()).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn decode_signature(hex_sig: &str) -> Option<Signature> {
    let bytes: [u8; 64] = hex::decode(hex_sig.trim()).ok()?.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

/// Fresh unique identifier for a new record
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn create_message(timestamp: &Timestamp, public_key: &str, hash: &str) -> String {
    format!("{}{}{}", timestamp, public_key, hash)
}

pub fn check_hash_message(timestamp: &Timestamp, id: &str, hash: &str) -> String {
    format!("{}{}{}", timestamp, id, hash)
}

pub fn update_hash_message(
    timestamp: &Timestamp,
    id: &str,
    old_hash: &str,
    new_hash: &str,
) -> String {
    format!("{}{}{}{}", timestamp, id, old_hash, new_hash)
}

pub fn delete_message(timestamp: &Timestamp, id: &str, hash: &str) -> String {
    format!("{}{}{}", timestamp, id, hash)
}

/// Message this service signs when registering with discovery
pub fn registration_message(timestamp: &Timestamp, public_key: &str) -> String {
    format!("{}{}", timestamp, public_key)
}

pub fn gateway_message(timestamp: &Timestamp, id: &str, minimum_cost: u64, ordinal: u64) -> String {
    format!("{}{}{}{}", timestamp, id, minimum_cost, ordinal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::NodeKeys;

    #[test]
    fn test_verify_roundtrip() {
        let keys = NodeKeys::generate();
        let message = create_message(&Timestamp::new("1"), &keys.public_key_hex(), "h1");
        let signature = keys.sign(&message);

        assert!(Ed25519Verifier.verify(&signature, &message, &keys.public_key_hex()));
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let signer = NodeKeys::generate();
        let other = NodeKeys::generate();
        let signature = signer.sign("message");

        assert!(!Ed25519Verifier.verify(&signature, "message", &other.public_key_hex()));
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let keys = NodeKeys::generate();
        let signature = keys.sign("message");

        assert!(!Ed25519Verifier.verify(&signature, "messagf", &keys.public_key_hex()));
    }

    #[test]
    fn test_verify_garbage_is_false() {
        let keys = NodeKeys::generate();
        assert!(!Ed25519Verifier.verify("zz", "m", &keys.public_key_hex()));
        assert!(!Ed25519Verifier.verify(&keys.sign("m"), "m", "not-hex"));
        assert!(!Ed25519Verifier.verify("", "m", ""));
    }

    #[test]
    fn test_verify_rejects_small_order_key() {
        // Identity point as key, identity R and zero s: satisfies the plain
        // verification equation for any message
        let mut identity = [0u8; 32];
        identity[0] = 1;
        let public_key = hex::encode(identity);
        let signature = format!("{}{}", hex::encode(identity), hex::encode([0u8; 32]));

        assert!(!Ed25519Verifier.verify(&signature, "any message", &public_key));
        assert!(!Ed25519Verifier.verify(&signature, "another", &public_key));
    }

    #[test]
    fn test_message_order() {
        let ts = Timestamp::new("100");
        assert_eq!(create_message(&ts, "K", "h"), "100Kh");
        assert_eq!(update_hash_message(&ts, "U1", "h1", "h2"), "100U1h1h2");
        assert_eq!(gateway_message(&ts, "U1", 20, 3), "100U1203");
    }

    #[test]
    fn test_generate_id_unique() {
        assert_ne!(generate_id(), generate_id());
        assert_eq!(generate_id().len(), 36);
    }
}
