//! Identity Service
//!
//! The hash-custody state machine: `absent -> active -> deleted`.
//!
//! Every signed operation runs its checks in the same order:
//!
//! 1. freshness of the claimed timestamp (no I/O)
//! 2. record lookup, for operations on an existing id
//! 3. signature over the operation's message, against the stored key
//! 4. the store write
//!
//! Freshness and signature failures both surface as
//! [`ContinuebeeError::Auth`]; the reason is only logged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::signature::{
    check_hash_message, create_message, delete_message, update_hash_message,
};
use crate::auth::{FreshnessGuard, SignatureVerifier, Timestamp};
use crate::storage::{InsertOutcome, RecordDraft, RecordStore, SwapOutcome, UserRecord};
use crate::types::{ContinuebeeError, Result};

// =============================================================================
// Configuration
// =============================================================================

/// What `create` does when the public key already owns a different hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum KeyReusePolicy {
    /// Fail with a conflict and leave the store untouched
    #[default]
    Reject,
    /// Allocate a new record and repoint the key index at it
    Reissue,
}

/// Default bound on a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub freshness: FreshnessGuard,
    pub key_reuse: KeyReusePolicy,
    pub store_timeout: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            freshness: FreshnessGuard::default(),
            key_reuse: KeyReusePolicy::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

// =============================================================================
// Requests
// =============================================================================
//
// Wire shapes have every field optional; `validate` turns them into the
// checked operation inputs. A missing timestamp or signature is an auth
// failure, any other missing field is a validation error.

/// `POST /user/create` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub timestamp: Option<Timestamp>,
    pub pub_key: Option<String>,
    pub hash: Option<String>,
    pub signature: Option<String>,
}

/// `GET /user/{uuid}` query plus path id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckHashRequest {
    #[serde(rename = "userUUID", alias = "uuid")]
    pub user_uuid: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub hash: Option<String>,
    pub signature: Option<String>,
}

/// `PUT /user/update-hash` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateHashRequest {
    pub timestamp: Option<Timestamp>,
    #[serde(rename = "userUUID", alias = "uuid")]
    pub user_uuid: Option<String>,
    pub hash: Option<String>,
    pub new_hash: Option<String>,
    pub signature: Option<String>,
}

/// `DELETE /user/delete` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteUserRequest {
    pub timestamp: Option<Timestamp>,
    #[serde(rename = "userUUID", alias = "uuid")]
    pub user_uuid: Option<String>,
    pub hash: Option<String>,
    pub signature: Option<String>,
}

/// Signed inputs shared by every operation
#[derive(Debug, Clone)]
pub struct Signed {
    pub timestamp: Timestamp,
    pub signature: String,
}

#[derive(Debug, Clone)]
pub struct CreateUser {
    pub signed: Signed,
    pub public_key: String,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct CheckHash {
    pub signed: Signed,
    pub id: String,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct UpdateHash {
    pub signed: Signed,
    pub id: String,
    pub old_hash: String,
    pub new_hash: String,
}

#[derive(Debug, Clone)]
pub struct DeleteUser {
    pub signed: Signed,
    pub id: String,
    pub hash: String,
}

/// Collects missing field names while pulling values out of a request
#[derive(Default)]
struct Fields {
    missing: Vec<&'static str>,
}

impl Fields {
    fn take(&mut self, name: &'static str, value: Option<String>) -> String {
        match value.filter(|v| !v.is_empty()) {
            Some(v) => v,
            None => {
                self.missing.push(name);
                String::new()
            }
        }
    }

    fn finish(self) -> Result<()> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(ContinuebeeError::missing_fields(&self.missing))
        }
    }
}

fn signed(timestamp: Option<Timestamp>, signature: Option<String>) -> Result<Signed> {
    match (timestamp, signature.filter(|s| !s.is_empty())) {
        (Some(timestamp), Some(signature)) => Ok(Signed {
            timestamp,
            signature,
        }),
        _ => {
            debug!("Rejecting request without timestamp or signature");
            Err(ContinuebeeError::Auth)
        }
    }
}

impl CreateUserRequest {
    pub fn validate(self) -> Result<CreateUser> {
        let mut fields = Fields::default();
        let public_key = fields.take("pubKey", self.pub_key);
        let hash = fields.take("hash", self.hash);
        fields.finish()?;
        Ok(CreateUser {
            signed: signed(self.timestamp, self.signature)?,
            public_key,
            hash,
        })
    }
}

impl CheckHashRequest {
    pub fn validate(self) -> Result<CheckHash> {
        let mut fields = Fields::default();
        let id = fields.take("userUUID", self.user_uuid);
        let hash = fields.take("hash", self.hash);
        fields.finish()?;
        Ok(CheckHash {
            signed: signed(self.timestamp, self.signature)?,
            id,
            hash,
        })
    }
}

impl UpdateHashRequest {
    pub fn validate(self) -> Result<UpdateHash> {
        let mut fields = Fields::default();
        let id = fields.take("userUUID", self.user_uuid);
        let old_hash = fields.take("hash", self.hash);
        let new_hash = fields.take("newHash", self.new_hash);
        fields.finish()?;
        Ok(UpdateHash {
            signed: signed(self.timestamp, self.signature)?,
            id,
            old_hash,
            new_hash,
        })
    }
}

impl DeleteUserRequest {
    pub fn validate(self) -> Result<DeleteUser> {
        let mut fields = Fields::default();
        let id = fields.take("userUUID", self.user_uuid);
        let hash = fields.take("hash", self.hash);
        fields.finish()?;
        Ok(DeleteUser {
            signed: signed(self.timestamp, self.signature)?,
            id,
            hash,
        })
    }
}

/// Result of an authenticated hash check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCheck {
    Match,
    /// Signature was valid, the hash was not the stored one
    Mismatch,
}

// =============================================================================
// Service
// =============================================================================

pub struct IdentityService {
    store: Arc<dyn RecordStore>,
    verifier: Arc<dyn SignatureVerifier>,
    config: IdentityConfig,
}

impl IdentityService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        verifier: Arc<dyn SignatureVerifier>,
        config: IdentityConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Register a key and hash. Re-registering the same pair returns the
    /// existing record.
    pub async fn create(&self, req: CreateUser) -> Result<UserRecord> {
        self.check_fresh(&req.signed.timestamp)?;

        let message = create_message(&req.signed.timestamp, &req.public_key, &req.hash);
        self.check_signature(&req.signed.signature, &message, &req.public_key)?;

        self.register(&req.public_key, &req.hash).await
    }

    /// Compare a hash against the stored one. Never writes.
    pub async fn check_hash(&self, req: CheckHash) -> Result<HashCheck> {
        self.check_fresh(&req.signed.timestamp)?;
        let record = self.load(&req.id).await?;

        let message = check_hash_message(&req.signed.timestamp, &req.id, &req.hash);
        self.check_signature(&req.signed.signature, &message, &record.public_key)?;

        if record.hash == req.hash {
            Ok(HashCheck::Match)
        } else {
            debug!(id = %req.id, "Hash check mismatch");
            Ok(HashCheck::Mismatch)
        }
    }

    /// Replace the stored hash. The claimed old hash must be the stored one.
    pub async fn update_hash(&self, req: UpdateHash) -> Result<UserRecord> {
        self.check_fresh(&req.signed.timestamp)?;
        let record = self.load(&req.id).await?;

        let message =
            update_hash_message(&req.signed.timestamp, &req.id, &req.old_hash, &req.new_hash);
        self.check_signature(&req.signed.signature, &message, &record.public_key)?;

        self.swap(&req.id, &req.old_hash, &req.new_hash).await
    }

    /// Erase a record and its key index entry
    pub async fn delete_user(&self, req: DeleteUser) -> Result<bool> {
        self.check_fresh(&req.signed.timestamp)?;
        let record = self.load(&req.id).await?;

        let message = delete_message(&req.signed.timestamp, &req.id, &req.hash);
        self.check_signature(&req.signed.signature, &message, &record.public_key)?;

        self.remove(&record, &req.hash).await
    }

    // -------------------------------------------------------------------------
    // Pre-authorized variants used by the spell relay. The orchestrator that
    // dispatched the spell already verified the caster.
    // -------------------------------------------------------------------------

    pub async fn create_trusted(&self, public_key: &str, hash: &str) -> Result<UserRecord> {
        self.register(public_key, hash).await
    }

    pub async fn update_hash_trusted(
        &self,
        id: &str,
        old_hash: &str,
        new_hash: &str,
    ) -> Result<UserRecord> {
        self.swap(id, old_hash, new_hash).await
    }

    pub async fn delete_trusted(&self, id: &str, hash: &str) -> Result<bool> {
        let record = self.load(id).await?;
        self.remove(&record, hash).await
    }

    // -------------------------------------------------------------------------

    async fn register(&self, public_key: &str, hash: &str) -> Result<UserRecord> {
        let draft = RecordDraft::new(public_key, hash);
        let existing = match self.bounded(self.store.insert_if_key_absent(draft)).await? {
            InsertOutcome::Inserted(record) => {
                info!(id = %record.id, "Created user");
                return Ok(record);
            }
            InsertOutcome::Existing(existing) => existing,
        };

        if existing.hash == hash {
            debug!(id = %existing.id, "Create matched existing record");
            return Ok(existing);
        }
        if self.config.key_reuse == KeyReusePolicy::Reject {
            return Err(ContinuebeeError::Conflict(
                "public key already registered".into(),
            ));
        }

        info!(old_id = %existing.id, "Reissuing record for reused public key");
        let record = self
            .bounded(self.store.put(RecordDraft::new(public_key, hash)))
            .await?;
        info!(id = %record.id, "Created user");
        Ok(record)
    }

    async fn swap(&self, id: &str, old_hash: &str, new_hash: &str) -> Result<UserRecord> {
        match self.bounded(self.store.swap_hash(id, old_hash, new_hash)).await? {
            SwapOutcome::Swapped(record) => {
                info!(id = %id, "Updated hash");
                Ok(record)
            }
            SwapOutcome::Stale => Err(ContinuebeeError::HashMismatch),
            SwapOutcome::Missing => Err(not_found(id)),
        }
    }

    async fn remove(&self, record: &UserRecord, hash: &str) -> Result<bool> {
        if record.hash != hash {
            return Err(ContinuebeeError::HashMismatch);
        }
        if !self.bounded(self.store.delete(&record.id)).await? {
            return Err(not_found(&record.id));
        }
        info!(id = %record.id, "Deleted user");
        Ok(true)
    }

    async fn load(&self, id: &str) -> Result<UserRecord> {
        self.bounded(self.store.get(id))
            .await?
            .ok_or_else(|| not_found(id))
    }

    fn check_fresh(&self, timestamp: &Timestamp) -> Result<()> {
        if self.config.freshness.check(timestamp) {
            Ok(())
        } else {
            debug!("Rejecting request outside freshness window");
            Err(ContinuebeeError::Auth)
        }
    }

    fn check_signature(&self, signature: &str, message: &str, public_key: &str) -> Result<()> {
        if self.verifier.verify(signature, message, public_key) {
            Ok(())
        } else {
            debug!(public_key = %public_key, "Rejecting request with bad signature");
            Err(ContinuebeeError::Auth)
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.store_timeout, call)
            .await
            .map_err(|_| ContinuebeeError::Storage("store timed out".into()))?
    }
}

fn not_found(id: &str) -> ContinuebeeError {
    ContinuebeeError::NotFound(format!("user {}", id))
}
