//! POST /magic/spell/{spellName}
//!
//! Always answers 200 with a spell envelope. Success or failure lives in the
//! envelope's `success` flag, never in the HTTP status.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

use super::{json_response, parse_json};
use crate::server::AppState;
use crate::services::{Spell, SpellResult};

pub async fn handle_spell(state: &AppState, spell_name: &str, body: Bytes) -> Response<Full<Bytes>> {
    let result = match parse_json::<Spell>(&body) {
        Ok(spell) => state.magic.cast(spell_name, spell).await,
        Err(e) => SpellResult::failure(e.to_string()),
    };
    json_response(StatusCode::OK, &result)
}
