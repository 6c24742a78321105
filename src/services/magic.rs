//! MAGIC: the spell relay
//!
//! A spell is a pre-authorized request travelling through a chain of
//! services. The orchestrator that dispatched it already verified the caster
//! and charged the cost, so this relay only checks that the components it
//! needs are present before running the local operation.
//!
//! Every outcome is a [`SpellResult`]. Errors, including panics in the local
//! operation, become `{success: false, error}`; nothing escapes [`MagicService::cast`].
//!
//! ## Spells
//!
//! | Spell                       | Components                    |
//! |-----------------------------|-------------------------------|
//! | `continuebeeUserCreate`     | `pubKey`, `hash`              |
//! | `continuebeeUserUpdateHash` | `userUUID`, `hash`, `newHash` |
//! | `continuebeeUserDelete`     | `userUUID`, `hash`            |
//! | `joinup`                    | `pubKey`, `hash`              |

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::auth::signature::gateway_message;
use crate::auth::Timestamp;
use crate::services::bootstrap::Federation;
use crate::services::identity::IdentityService;
use crate::storage::UserRecord;
use crate::types::{ContinuebeeError, Result};

pub const USER_CREATE: &str = "continuebeeUserCreate";
pub const USER_UPDATE_HASH: &str = "continuebeeUserUpdateHash";
pub const USER_DELETE: &str = "continuebeeUserDelete";
pub const JOINUP: &str = "joinup";

/// Cost this service contributes to a chain unless configured otherwise
pub const DEFAULT_MINIMUM_COST: u64 = 20;

// =============================================================================
// Envelope types
// =============================================================================

/// Inbound spell envelope. Fields this relay does not read are carried in
/// `extra` so a forwarded spell keeps everything the caster sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spell {
    #[serde(default)]
    pub spell: String,
    #[serde(rename = "casterUUID", default, skip_serializing_if = "Option::is_none")]
    pub caster_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caster_signature: Option<String>,
    #[serde(default)]
    pub gateways: Vec<Value>,
    #[serde(default)]
    pub components: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Spell {
    /// Pull required string components, reporting every missing one at once
    fn require<const N: usize>(&self, names: [&'static str; N]) -> Result<[String; N]> {
        let mut missing = Vec::new();
        let values = names.map(|name| {
            match self.components.get(name).and_then(Value::as_str) {
                Some(v) if !v.is_empty() => v.to_string(),
                _ => {
                    missing.push(name);
                    String::new()
                }
            }
        });
        if missing.is_empty() {
            Ok(values)
        } else {
            Err(ContinuebeeError::missing_fields(&missing))
        }
    }
}

/// An entry in the accumulated identity list: which service minted which id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceId {
    pub service: String,
    #[serde(alias = "uuid")]
    pub id: String,
}

/// Outbound envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpellResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uuids: Vec<ServiceId>,
    /// Fields added by downstream stops, passed back untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SpellResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    fn with_user(mut self, user: UserRecord) -> Self {
        self.user = Some(user);
        self
    }

    fn with_id(mut self, service: &str, id: &str) -> Self {
        self.uuids.push(ServiceId {
            service: service.to_string(),
            id: id.to_string(),
        });
        self
    }
}

/// Signed attestation that this service took part in a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    pub timestamp: Timestamp,
    pub uuid: String,
    pub minimum_cost: u64,
    pub ordinal: u64,
    pub signature: String,
}

// =============================================================================
// Forwarding
// =============================================================================

/// Sends a spell to the next stop in the chain
#[async_trait]
pub trait SpellForwarder: Send + Sync {
    async fn forward(&self, url: &str, spell: &Spell) -> Result<SpellResult>;
}

pub struct HttpForwarder {
    http_client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ContinuebeeError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl SpellForwarder for HttpForwarder {
    async fn forward(&self, url: &str, spell: &Spell) -> Result<SpellResult> {
        debug!(url = %url, spell = %spell.spell, "Forwarding spell");

        let response = self.http_client.post(url).json(spell).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        // Downstream stops answer failures with an envelope too, whatever the status
        serde_json::from_slice(&bytes).map_err(|_| {
            ContinuebeeError::Upstream(format!("{} answered HTTP {} without an envelope", url, status))
        })
    }
}

// =============================================================================
// Relay
// =============================================================================

pub struct MagicService {
    identity: Arc<IdentityService>,
    federation: Arc<Federation>,
    forwarder: Arc<dyn SpellForwarder>,
    minimum_cost: u64,
}

impl MagicService {
    pub fn new(
        identity: Arc<IdentityService>,
        federation: Arc<Federation>,
        forwarder: Arc<dyn SpellForwarder>,
        minimum_cost: u64,
    ) -> Self {
        Self {
            identity,
            federation,
            forwarder,
            minimum_cost,
        }
    }

    /// Resolve a spell. Never fails and never panics across this boundary.
    pub async fn cast(&self, spell_name: &str, mut spell: Spell) -> SpellResult {
        if spell.spell.is_empty() {
            spell.spell = spell_name.to_string();
        }

        match AssertUnwindSafe(self.dispatch(spell_name, spell))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                debug!(spell = %spell_name, error = %e, "Spell failed");
                SpellResult::failure(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(spell = %spell_name, panic = %message, "Spell panicked");
                SpellResult::failure(format!("Internal error: {}", message))
            }
        }
    }

    async fn dispatch(&self, spell_name: &str, spell: Spell) -> Result<SpellResult> {
        match spell_name {
            USER_CREATE => self.user_create(&spell).await,
            USER_UPDATE_HASH => self.user_update_hash(&spell).await,
            USER_DELETE => self.user_delete(&spell).await,
            JOINUP => self.joinup(spell).await,
            other => Ok(SpellResult::failure(format!("Unknown spell: {}", other))),
        }
    }

    fn service(&self) -> &str {
        self.federation.service_name()
    }

    async fn user_create(&self, spell: &Spell) -> Result<SpellResult> {
        let [public_key, hash] = spell.require(["pubKey", "hash"])?;
        let user = self.identity.create_trusted(&public_key, &hash).await?;
        let id = user.id.clone();
        Ok(SpellResult::ok().with_user(user).with_id(self.service(), &id))
    }

    async fn user_update_hash(&self, spell: &Spell) -> Result<SpellResult> {
        let [id, hash, new_hash] = spell.require(["userUUID", "hash", "newHash"])?;
        let user = self.identity.update_hash_trusted(&id, &hash, &new_hash).await?;
        Ok(SpellResult::ok().with_user(user).with_id(self.service(), &id))
    }

    async fn user_delete(&self, spell: &Spell) -> Result<SpellResult> {
        let [id, hash] = spell.require(["userUUID", "hash"])?;
        self.identity.delete_trusted(&id, &hash).await?;
        Ok(SpellResult::ok().with_id(self.service(), &id))
    }

    /// Sign a gateway for this hop, hand the spell to the following stop,
    /// then register the caster locally if the rest of the chain succeeded.
    async fn joinup(&self, mut spell: Spell) -> Result<SpellResult> {
        let [public_key, hash] = spell.require(["pubKey", "hash"])?;

        let uuid = self.federation.uuid().await.ok_or_else(|| {
            ContinuebeeError::Config("service has not registered with discovery".into())
        })?;
        let spellbook = self
            .federation
            .spellbook()
            .await
            .ok_or_else(|| ContinuebeeError::Config("no spellbook loaded".into()))?;
        let next = spellbook.next_after(self.service())?;

        spell
            .gateways
            .push(serde_json::to_value(self.sign_gateway(&uuid))?);

        let url = next.spell_url(&spell.spell);
        let downstream = self.forwarder.forward(&url, &spell).await?;
        if !downstream.success {
            debug!(url = %url, "Downstream stop refused spell");
            return Ok(downstream);
        }

        let user = self.identity.create_trusted(&public_key, &hash).await?;
        info!(id = %user.id, "Joined user through spell chain");
        Ok(downstream.with_id(self.service(), &user.id))
    }

    fn sign_gateway(&self, uuid: &str) -> Gateway {
        let timestamp = Timestamp::now();
        let ordinal = self.federation.next_ordinal();
        let signature = self.federation.keys().sign(&gateway_message(
            &timestamp,
            uuid,
            self.minimum_cost,
            ordinal,
        ));
        Gateway {
            timestamp,
            uuid: uuid.to_string(),
            minimum_cost: self.minimum_cost,
            ordinal,
            signature,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Ed25519Verifier, NodeKeys, SignatureVerifier};
    use crate::services::identity::IdentityConfig;
    use crate::services::spellbook::{Destination, Spellbook};
    use crate::storage::{MemoryStore, RecordStore};
    use tokio::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records forwarded spells and answers with a canned envelope
    struct FakeForwarder {
        reply: SpellResult,
        sent: Mutex<Vec<(String, Spell)>>,
    }

    impl FakeForwarder {
        fn replying(reply: SpellResult) -> Arc<Self> {
            Arc::new(Self {
                reply,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SpellForwarder for FakeForwarder {
        async fn forward(&self, url: &str, spell: &Spell) -> Result<SpellResult> {
            self.sent.lock().await.push((url.to_string(), spell.clone()));
            Ok(self.reply.clone())
        }
    }

    struct PanickingForwarder;

    #[async_trait]
    impl SpellForwarder for PanickingForwarder {
        async fn forward(&self, _url: &str, _spell: &Spell) -> Result<SpellResult> {
            panic!("forwarder exploded");
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        federation: Arc<Federation>,
        magic: MagicService,
    }

    fn fixture(forwarder: Arc<dyn SpellForwarder>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let identity = Arc::new(IdentityService::new(
            store.clone(),
            Arc::new(Ed25519Verifier),
            IdentityConfig::default(),
        ));
        let federation = Arc::new(Federation::new(
            "continuebee",
            Arc::new(NodeKeys::generate()),
        ));
        let magic = MagicService::new(
            identity,
            federation.clone(),
            forwarder,
            DEFAULT_MINIMUM_COST,
        );
        Fixture {
            store,
            federation,
            magic,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(FakeForwarder::replying(SpellResult::ok()))
    }

    fn spell(name: &str, components: Value) -> Spell {
        serde_json::from_value(serde_json::json!({
            "spell": name,
            "casterUUID": "caster",
            "timestamp": Timestamp::now(),
            "totalCost": 50,
            "mp": true,
            "ordinal": 0,
            "casterSignature": "sig",
            "components": components,
        }))
        .unwrap()
    }

    async fn joined(fx: &Fixture) {
        fx.federation.set_uuid("F-CB".into()).await;
        fx.federation
            .set_spellbook(Spellbook {
                destinations: vec![
                    Destination {
                        stop_name: "fount".into(),
                        stop_url: "http://fount/magic/spell/".into(),
                    },
                    Destination {
                        stop_name: "continuebee".into(),
                        stop_url: "http://cb/magic/spell/".into(),
                    },
                    Destination {
                        stop_name: "addie".into(),
                        stop_url: "http://addie/magic/spell/".into(),
                    },
                ],
            })
            .await;
    }

    #[tokio::test]
    async fn test_create_spell() {
        let fx = default_fixture();

        let result = fx
            .magic
            .cast(USER_CREATE, spell(USER_CREATE, serde_json::json!({"pubKey": "K", "hash": "h1"})))
            .await;
        assert!(result.success);
        let user = result.user.unwrap();
        assert_eq!(user.public_key, "K");
        assert_eq!(user.hash, "h1");
        assert_eq!(
            result.uuids,
            vec![ServiceId {
                service: "continuebee".into(),
                id: user.id.clone()
            }]
        );

        // Same key and hash again resolves to the same record
        let again = fx
            .magic
            .cast(USER_CREATE, spell(USER_CREATE, serde_json::json!({"pubKey": "K", "hash": "h1"})))
            .await;
        assert_eq!(again.user.unwrap().id, user.id);
    }

    #[tokio::test]
    async fn test_create_spell_missing_hash_leaves_store_unchanged() {
        let fx = default_fixture();

        let result = fx
            .magic
            .cast(USER_CREATE, spell(USER_CREATE, serde_json::json!({"pubKey": "K"})))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Missing required fields: hash"));
        assert!(fx.store.is_empty());

        let result = fx
            .magic
            .cast(USER_CREATE, spell(USER_CREATE, serde_json::json!({})))
            .await;
        assert_eq!(
            result.error.as_deref(),
            Some("Missing required fields: pubKey, hash")
        );
    }

    #[tokio::test]
    async fn test_update_and_delete_spells() {
        let fx = default_fixture();
        let user = fx
            .magic
            .cast(USER_CREATE, spell(USER_CREATE, serde_json::json!({"pubKey": "K", "hash": "h1"})))
            .await
            .user
            .unwrap();

        let wrong = fx
            .magic
            .cast(
                USER_UPDATE_HASH,
                spell(
                    USER_UPDATE_HASH,
                    serde_json::json!({"userUUID": user.id, "hash": "wrong", "newHash": "h2"}),
                ),
            )
            .await;
        assert!(!wrong.success);
        assert!(wrong.error.is_some());

        let updated = fx
            .magic
            .cast(
                USER_UPDATE_HASH,
                spell(
                    USER_UPDATE_HASH,
                    serde_json::json!({"userUUID": user.id, "hash": "h1", "newHash": "h2"}),
                ),
            )
            .await;
        assert!(updated.success);
        assert_eq!(updated.user.unwrap().hash, "h2");

        let missing = fx
            .magic
            .cast(USER_DELETE, spell(USER_DELETE, serde_json::json!({"userUUID": user.id})))
            .await;
        assert_eq!(missing.error.as_deref(), Some("Missing required fields: hash"));

        let deleted = fx
            .magic
            .cast(
                USER_DELETE,
                spell(USER_DELETE, serde_json::json!({"userUUID": user.id, "hash": "h2"})),
            )
            .await;
        assert!(deleted.success);
        assert!(fx.store.get(&user.id).await.unwrap().is_none());

        let gone = fx
            .magic
            .cast(
                USER_DELETE,
                spell(USER_DELETE, serde_json::json!({"userUUID": user.id, "hash": "h2"})),
            )
            .await;
        assert!(!gone.success);
    }

    #[tokio::test]
    async fn test_unknown_spell() {
        let fx = default_fixture();
        let result = fx.magic.cast("fireball", spell("fireball", serde_json::json!({}))).await;
        assert_eq!(result, SpellResult::failure("Unknown spell: fireball"));
    }

    #[tokio::test]
    async fn test_joinup_forwards_to_following_stop() {
        let forwarder = FakeForwarder::replying(SpellResult::ok().with_id("addie", "A1"));
        let fx = fixture(forwarder.clone());
        joined(&fx).await;

        let result = fx
            .magic
            .cast(JOINUP, spell(JOINUP, serde_json::json!({"pubKey": "K", "hash": "h1"})))
            .await;
        assert!(result.success, "{:?}", result.error);

        let user = fx.store.get_by_public_key("K").await.unwrap().unwrap();
        assert_eq!(
            result.uuids,
            vec![
                ServiceId {
                    service: "addie".into(),
                    id: "A1".into()
                },
                ServiceId {
                    service: "continuebee".into(),
                    id: user.id
                },
            ]
        );

        let sent = forwarder.sent.lock().await;
        assert_eq!(sent.len(), 1);
        let (url, forwarded) = &sent[0];
        assert_eq!(url, "http://addie/magic/spell/joinup");
        assert_eq!(forwarded.caster_uuid.as_deref(), Some("caster"));

        let gateway: Gateway = serde_json::from_value(forwarded.gateways[0].clone()).unwrap();
        assert_eq!(gateway.uuid, "F-CB");
        assert_eq!(gateway.minimum_cost, DEFAULT_MINIMUM_COST);
        let message = gateway_message(
            &gateway.timestamp,
            &gateway.uuid,
            gateway.minimum_cost,
            gateway.ordinal,
        );
        assert!(Ed25519Verifier.verify(
            &gateway.signature,
            &message,
            &fx.federation.keys().public_key_hex()
        ));
    }

    #[tokio::test]
    async fn test_joinup_downstream_failure_is_returned_as_is() {
        let refusal = SpellResult::failure("insufficient mp");
        let fx = fixture(FakeForwarder::replying(refusal.clone()));
        joined(&fx).await;

        let result = fx
            .magic
            .cast(JOINUP, spell(JOINUP, serde_json::json!({"pubKey": "K", "hash": "h1"})))
            .await;
        assert_eq!(result, refusal);
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_joinup_requires_registration() {
        let fx = default_fixture();
        let result = fx
            .magic
            .cast(JOINUP, spell(JOINUP, serde_json::json!({"pubKey": "K", "hash": "h1"})))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("discovery"));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let fx = fixture(Arc::new(PanickingForwarder));
        joined(&fx).await;

        let result = fx
            .magic
            .cast(JOINUP, spell(JOINUP, serde_json::json!({"pubKey": "K", "hash": "h1"})))
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Internal error: forwarder exploded")
        );
    }

    #[test]
    fn test_envelope_keeps_unknown_fields() {
        let spell: Spell = serde_json::from_value(serde_json::json!({
            "spell": "joinup",
            "gateways": [],
            "components": {},
            "fountData": {"x": 1}
        }))
        .unwrap();
        let back = serde_json::to_value(&spell).unwrap();
        assert_eq!(back["fountData"], serde_json::json!({"x": 1}));

        let entry: ServiceId =
            serde_json::from_value(serde_json::json!({"service": "fount", "uuid": "F1"})).unwrap();
        assert_eq!(entry.id, "F1");
    }

    #[tokio::test]
    async fn test_http_forwarder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/magic/spell/joinup"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "success": false,
                "error": "bad gateway signature"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/magic/spell/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let forwarder = HttpForwarder::new(Duration::from_secs(5)).unwrap();

        let url = format!("{}/magic/spell/joinup", server.uri());
        let result = forwarder.forward(&url, &Spell::default()).await.unwrap();
        assert_eq!(result, SpellResult::failure("bad gateway signature"));

        let url = format!("{}/magic/spell/broken", server.uri());
        assert!(matches!(
            forwarder.forward(&url, &Spell::default()).await,
            Err(ContinuebeeError::Upstream(_))
        ));
    }
}
