//! GET /health
//!
//! Liveness: 200 whenever the process is serving. `ready` reports whether
//! bootstrap has finished; an unfederated service is ready at startup.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Record store backend in use
    pub backend: &'static str,
    pub ready: bool,
}

pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let response = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        backend: state.identity.store().backend(),
        ready: state.federation.is_ready(),
    };
    json_response(StatusCode::OK, &response)
}
