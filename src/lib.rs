//! Continuebee - signature-authenticated hash custody
//!
//! Continuebee keeps one hash per user, keyed by a service-issued uuid and
//! indexed by public key. There are no passwords or sessions: every request
//! is authenticated by a fresh timestamp and a signature over the request's
//! fields.
//!
//! ## Services
//!
//! - **Identity**: create, check, update and delete user hashes over REST
//! - **Magic**: the same operations as relayed spells, plus `joinup`, which
//!   signs a gateway and forwards the spell to the next stop in the spellbook
//! - **Bootstrap**: registers this service with a discovery service and
//!   fetches its spellbook, retrying with backoff
//!
//! ## Storage
//!
//! Records live in one of several backends chosen by `STORAGE_URI`; see
//! [`storage`].

pub mod auth;
pub mod config;
pub mod routes;
pub mod server;
pub mod services;
pub mod storage;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{ContinuebeeError, Result};
