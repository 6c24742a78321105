//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. Every connection gets
//! its own task; request bodies are collected up to [`MAX_BODY_BYTES`]
//! before routing.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::routes;
use crate::services::{Federation, IdentityService, MagicService};
use crate::types::{ContinuebeeError, Result};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Largest request body accepted
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared application state
pub struct AppState {
    /// Signature-authenticated user records
    pub identity: Arc<IdentityService>,
    /// Spell resolution
    pub magic: Arc<MagicService>,
    /// This service's own identity in the spell network
    pub federation: Arc<Federation>,
}

impl AppState {
    pub fn new(
        identity: Arc<IdentityService>,
        magic: Arc<MagicService>,
        federation: Arc<Federation>,
    ) -> Self {
        Self {
            identity,
            magic,
            federation,
        }
    }
}

/// Bind `listen` and serve until the task is dropped
pub async fn run(state: Arc<AppState>, listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| ContinuebeeError::Config(format!("cannot bind {}: {}", listen, e)))?;
    info!(
        "Continuebee listening on {} (store: {})",
        listen,
        state.identity.store().backend()
    );
    serve(listener, state).await
}

/// Accept loop over an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();
    info!("[{}] {} {}", addr, parts.method, parts.uri.path());

    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Request body error from {}: {}", addr, e);
            return Ok(to_boxed(routes::error_response(ContinuebeeError::BadRequest(
                "Failed to read request body".into(),
            ))));
        }
    };

    let response = route(&state, &parts.method, parts.uri.path(), parts.uri.query(), body).await;
    debug!("[{}] -> {}", addr, response.status());
    Ok(to_boxed(response))
}

/// Dispatch a collected request to its handler
pub async fn route(
    state: &AppState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: Bytes,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/health") => routes::health_check(state),
        (&Method::POST, "/user/create") => routes::handle_create_user(state, body).await,
        (&Method::PUT, "/user/update-hash") => routes::handle_update_hash(state, body).await,
        (&Method::DELETE, "/user/delete") => routes::handle_delete_user(state, body).await,
        (&Method::GET, p) if single_segment(p, "/user/").is_some() => {
            let uuid = single_segment(p, "/user/").unwrap_or_default();
            routes::handle_check_hash(state, uuid, query).await
        }
        (&Method::POST, p) if single_segment(p, "/magic/spell/").is_some() => {
            let spell_name = single_segment(p, "/magic/spell/").unwrap_or_default();
            routes::handle_spell(state, spell_name, body).await
        }
        _ => routes::not_found_response(path),
    }
}

/// `/prefix/{segment}` with a non-empty segment and nothing after it
fn single_segment<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
}

fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}
