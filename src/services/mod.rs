//! Services layer
//!
//! ## Services
//!
//! - **Identity**: the signed create/check/update/delete state machine
//! - **Magic**: spell relay and joinup for federated spell chains
//! - **Spellbook**: chain topology and next-hop lookup
//! - **Bootstrap**: registration with discovery, retried with backoff

pub mod bootstrap;
pub mod identity;
pub mod magic;
pub mod spellbook;

pub use bootstrap::{spawn_bootstrap, BootstrapConfig, Federation, HttpRegistrar, Registrar};
pub use identity::{
    CheckHashRequest, CreateUserRequest, DeleteUserRequest, HashCheck, IdentityConfig,
    IdentityService, KeyReusePolicy, UpdateHashRequest,
};
pub use magic::{HttpForwarder, MagicService, ServiceId, Spell, SpellForwarder, SpellResult};
pub use spellbook::{Destination, Spellbook};
