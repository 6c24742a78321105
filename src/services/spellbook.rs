//! Spellbook: the chain topology shared by every service in a spell chain.
//!
//! ```json
//! { "destinations": [
//!     { "stopName": "fount", "stopURL": "http://localhost:3006/magic/spell/" },
//!     { "stopName": "continuebee", "stopURL": "http://localhost:2999/magic/spell/" }
//! ] }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{ContinuebeeError, Result};

/// One stop in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(rename = "stopName")]
    pub stop_name: String,
    #[serde(rename = "stopURL")]
    pub stop_url: String,
}

impl Destination {
    /// URL a spell with this name is posted to
    pub fn spell_url(&self, spell_name: &str) -> String {
        format!("{}{}", self.stop_url, spell_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spellbook {
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

impl Spellbook {
    /// Load a spellbook JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path).await.map_err(|e| {
            ContinuebeeError::Config(format!("Cannot read spellbook {}: {}", path.display(), e))
        })?;
        let spellbook: Spellbook = serde_json::from_slice(&raw).map_err(|e| {
            ContinuebeeError::Config(format!("Invalid spellbook {}: {}", path.display(), e))
        })?;

        info!(
            path = %path.display(),
            stops = spellbook.destinations.len(),
            "Loaded spellbook"
        );
        Ok(spellbook)
    }

    pub fn position(&self, stop_name: &str) -> Option<usize> {
        self.destinations
            .iter()
            .position(|d| d.stop_name == stop_name)
    }

    /// The stop following `stop_name`
    pub fn next_after(&self, stop_name: &str) -> Result<&Destination> {
        let index = self.position(stop_name).ok_or_else(|| {
            ContinuebeeError::Config(format!("{} is not a stop in the spellbook", stop_name))
        })?;
        self.destinations.get(index + 1).ok_or_else(|| {
            ContinuebeeError::Config(format!("{} is the last stop in the spellbook", stop_name))
        })
    }
}
