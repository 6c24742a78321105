//! Shared types for Continuebee

pub mod error;

pub use error::{ContinuebeeError, Result};
