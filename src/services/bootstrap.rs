//! Self-registration with the discovery service
//!
//! At startup the service registers its own public key with discovery to get
//! a federated uuid, and optionally pulls the spellbook. Failures are retried
//! with exponential backoff up to a bounded number of attempts. Readiness is
//! published on a `watch` channel; nothing in the identity core waits on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::signature::registration_message;
use crate::auth::{NodeKeys, Timestamp};
use crate::services::spellbook::Spellbook;
use crate::types::{ContinuebeeError, Result};

// =============================================================================
// Federation state
// =============================================================================

/// This service's place in spell chains: its keys, the uuid discovery gave
/// it, the gateway ordinal counter and the spellbook.
pub struct Federation {
    service_name: String,
    keys: Arc<NodeKeys>,
    uuid: RwLock<Option<String>>,
    ordinal: AtomicU64,
    spellbook: RwLock<Option<Spellbook>>,
    ready: watch::Sender<bool>,
}

impl Federation {
    pub fn new(service_name: impl Into<String>, keys: Arc<NodeKeys>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            service_name: service_name.into(),
            keys,
            uuid: RwLock::new(None),
            ordinal: AtomicU64::new(0),
            spellbook: RwLock::new(None),
            ready,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn keys(&self) -> &NodeKeys {
        &self.keys
    }

    pub async fn uuid(&self) -> Option<String> {
        self.uuid.read().await.clone()
    }

    pub async fn set_uuid(&self, uuid: String) {
        *self.uuid.write().await = Some(uuid);
    }

    pub async fn spellbook(&self) -> Option<Spellbook> {
        self.spellbook.read().await.clone()
    }

    pub async fn set_spellbook(&self, spellbook: Spellbook) {
        *self.spellbook.write().await = Some(spellbook);
    }

    pub async fn has_spellbook(&self) -> bool {
        self.spellbook.read().await.is_some()
    }

    /// Ordinal for the next gateway this service signs
    pub fn next_ordinal(&self) -> u64 {
        self.ordinal.fetch_add(1, Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }
}

// =============================================================================
// Registration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub timestamp: Timestamp,
    pub pub_key: String,
    pub signature: String,
}

impl RegistrationRequest {
    pub fn signed(keys: &NodeKeys) -> Self {
        let timestamp = Timestamp::now();
        let pub_key = keys.public_key_hex();
        let signature = keys.sign(&registration_message(&timestamp, &pub_key));
        Self {
            timestamp,
            pub_key,
            signature,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationResponse {
    pub uuid: String,
}

/// Talks to the discovery service
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Register our key, returning the uuid discovery assigned
    async fn register(&self, keys: &NodeKeys) -> Result<String>;

    /// The shared spellbook, if discovery publishes one
    async fn fetch_spellbook(&self) -> Result<Option<Spellbook>>;
}

/// Registrar over HTTP
pub struct HttpRegistrar {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpRegistrar {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ContinuebeeError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn register(&self, keys: &NodeKeys) -> Result<String> {
        let url = format!("{}/user/create", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&RegistrationRequest::signed(keys))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ContinuebeeError::Upstream(format!(
                "Registration returned HTTP {}",
                response.status()
            )));
        }
        let body: RegistrationResponse = response.json().await?;
        Ok(body.uuid)
    }

    async fn fetch_spellbook(&self) -> Result<Option<Spellbook>> {
        let url = format!("{}/spellbook", self.base_url);
        let response = self.http_client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ContinuebeeError::Upstream(format!(
                "Spellbook fetch returned HTTP {}",
                response.status()
            )));
        }
        Ok(Some(response.json().await?))
    }
}

// =============================================================================
// Retry loop
// =============================================================================

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

async fn register_once(federation: &Federation, registrar: &dyn Registrar) -> Result<()> {
    let uuid = registrar.register(federation.keys()).await?;
    info!(uuid = %uuid, "Registered with discovery");
    federation.set_uuid(uuid).await;

    if !federation.has_spellbook().await {
        match registrar.fetch_spellbook().await? {
            Some(spellbook) => federation.set_spellbook(spellbook).await,
            None => debug!("Discovery publishes no spellbook"),
        }
    }
    Ok(())
}

/// Register with discovery, retrying with backoff. Marks the federation
/// ready on success.
pub async fn bootstrap(
    federation: &Federation,
    registrar: &dyn Registrar,
    config: &BootstrapConfig,
) -> Result<()> {
    let mut delay = config.initial_delay.min(config.max_delay);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match register_once(federation, registrar).await {
            Ok(()) => {
                federation.mark_ready();
                return Ok(());
            }
            Err(e) if attempt >= config.max_attempts => {
                error!(attempt, error = %e, "Bootstrap gave up");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Bootstrap failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(config.max_delay);
            }
        }
    }
}

/// Spawn bootstrap as a background task
pub fn spawn_bootstrap(
    federation: Arc<Federation>,
    registrar: Arc<dyn Registrar>,
    config: BootstrapConfig,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move { bootstrap(&federation, registrar.as_ref(), &config).await })
}
