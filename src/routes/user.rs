//! User endpoints
//!
//! - POST   /user/create        body `{timestamp, pubKey, hash, signature}`
//! - GET    /user/{uuid}        query `timestamp, hash, signature`
//! - PUT    /user/update-hash   body `{timestamp, userUUID, hash, newHash, signature}`
//! - DELETE /user/delete        body `{timestamp, userUUID, hash, signature}`

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::{error_response, parse_json, respond};
use crate::server::AppState;
use crate::services::{
    CheckHashRequest, CreateUserRequest, DeleteUserRequest, HashCheck, UpdateHashRequest,
};
use crate::types::{ContinuebeeError, Result};

#[derive(Debug, Serialize)]
struct CheckHashResponse {
    #[serde(rename = "userUUID")]
    user_uuid: String,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    success: bool,
}

pub async fn handle_create_user(state: &AppState, body: Bytes) -> Response<Full<Bytes>> {
    let result = async {
        let req: CreateUserRequest = parse_json(&body)?;
        state.identity.create(req.validate()?).await
    }
    .await;
    respond(StatusCode::OK, result)
}

/// 200 `{userUUID}` on a match, 406 when the signature is good but the hash is not
pub async fn handle_check_hash(
    state: &AppState,
    uuid: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let result: Result<HashCheck> = async {
        let mut req: CheckHashRequest = serde_urlencoded::from_str(query.unwrap_or(""))
            .map_err(|e| ContinuebeeError::BadRequest(e.to_string()))?;
        req.user_uuid = Some(uuid.to_string());
        state.identity.check_hash(req.validate()?).await
    }
    .await;

    match result {
        Ok(HashCheck::Match) => super::json_response(
            StatusCode::OK,
            &CheckHashResponse {
                user_uuid: uuid.to_string(),
            },
        ),
        Ok(HashCheck::Mismatch) => error_response(ContinuebeeError::HashMismatch),
        Err(e) => error_response(e),
    }
}

pub async fn handle_update_hash(state: &AppState, body: Bytes) -> Response<Full<Bytes>> {
    let result = async {
        let req: UpdateHashRequest = parse_json(&body)?;
        state.identity.update_hash(req.validate()?).await
    }
    .await;
    respond(StatusCode::ACCEPTED, result)
}

pub async fn handle_delete_user(state: &AppState, body: Bytes) -> Response<Full<Bytes>> {
    let result = async {
        let req: DeleteUserRequest = parse_json(&body)?;
        let success = state.identity.delete_user(req.validate()?).await?;
        Ok::<_, ContinuebeeError>(DeleteResponse { success })
    }
    .await;
    respond(StatusCode::OK, result)
}
