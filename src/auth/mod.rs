//! Request authentication
//!
//! - [`freshness`]: timestamp window check (cheap, runs first)
//! - [`signature`]: signature verification and signed-message layouts
//! - [`keys`]: this service's own keypair

pub mod freshness;
pub mod keys;
pub mod signature;

pub use freshness::{FreshnessGuard, Timestamp};
pub use keys::NodeKeys;
pub use signature::{generate_id, Ed25519Verifier, SignatureVerifier};
