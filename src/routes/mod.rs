//! HTTP routes for Continuebee
//!
//! Handlers take already-collected bodies so they can be driven directly in
//! tests without a socket.

pub mod health;
pub mod magic;
pub mod user;

pub use health::health_check;
pub use magic::handle_spell;
pub use user::{handle_check_hash, handle_create_user, handle_delete_user, handle_update_hash};

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use crate::types::{ContinuebeeError, Result};

/// JSON response with the given status
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => raw_json(status, bytes),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            error_response(ContinuebeeError::Internal("response encoding failed".into()))
        }
    }
}

/// `{"error": "..."}` with the error's status
pub fn error_response(err: ContinuebeeError) -> Response<Full<Bytes>> {
    let (status, body) = err.into_status_code_and_body();
    raw_json(status, body.into_bytes())
}

/// Not found response
pub fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    error_response(ContinuebeeError::NotFound(format!("no route for {}", path)))
}

fn raw_json(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Decode a JSON body. An empty body decodes as `{}`, leaving required
/// fields to request validation.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| ContinuebeeError::BadRequest(e.to_string()))
}

/// Turn a handler result into a response
pub(crate) fn respond<T: Serialize>(status: StatusCode, result: Result<T>) -> Response<Full<Bytes>> {
    match result {
        Ok(body) => json_response(status, &body),
        Err(e) => error_response(e),
    }
}
