//! The encrypting proxy in front of the state backend.
//!
//! Every request lands in one fallback handler:
//!
//! - `GET` is forwarded and a non-empty response body is decrypted. If the
//!   body cannot be decrypted it is returned unchanged, so state written
//!   before encryption was enabled stays readable.
//! - `POST` bodies are encrypted before forwarding. Nothing is sent to the
//!   backend if encryption fails.
//! - `LOCK` and `UNLOCK` are forwarded untouched under the configured
//!   backend verbs.
//! - Anything else is answered with `405` without contacting the backend.
//!
//! The verb is checked before the body is read, so an unsupported verb is
//! `405` whatever its body size. Bodies over the limit are `413`. Path and
//! query are appended to the backend base URL unchanged.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, FromRequest, Request, State};
use axum::http::{HeaderMap, HeaderName, Method, Uri};
use axum::response::{IntoResponse, Response};
use stateseal_core::TransformError;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::backend::BackendRequest;
use crate::error::ProxyError;
use crate::metrics::TransformKind;
use crate::state::AppState;

/// Headers the HTTP client sets itself on outgoing requests.
const REQUEST_MANAGED_HEADERS: [&str; 3] = ["host", "content-length", "transfer-encoding"];

/// Headers recomputed for the (possibly transformed) response body.
const RESPONSE_MANAGED_HEADERS: [&str; 2] = ["content-length", "transfer-encoding"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Get,
    Post,
    Lock,
    Unlock,
}

impl Verb {
    fn classify(method: &Method) -> Option<Self> {
        match method.as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "LOCK" => Some(Self::Lock),
            "UNLOCK" => Some(Self::Unlock),
            _ => None,
        }
    }
}

/// Build the proxy router.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.settings.max_body_bytes;
    Router::new()
        .fallback(handle)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = match forward(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(method = %method, path = %uri.path(), error = %e, "request failed");
            e.into_response()
        }
    };
    state.metrics.record_request(&method, response.status());
    response
}

async fn forward(state: &AppState, request: Request) -> Result<Response, ProxyError> {
    let verb = Verb::classify(request.method()).ok_or(ProxyError::MethodNotAllowed)?;
    let settings = &state.settings;

    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let body = Bytes::from_request(request, &()).await?;

    let (backend_method, body) = match verb {
        Verb::Get => (Method::GET, body),
        Verb::Post if body.is_empty() => (Method::POST, body),
        Verb::Post => (Method::POST, Bytes::from(encrypt(state, &body).await?)),
        Verb::Lock => (settings.lock_method.clone(), body),
        Verb::Unlock => (settings.unlock_method.clone(), body),
    };

    let request = BackendRequest {
        method: backend_method,
        url: backend_url(&settings.backend_url, &uri),
        headers: copy_headers(
            &headers,
            &REQUEST_MANAGED_HEADERS,
            &settings.ignored_request_headers,
        ),
        body,
    };
    debug!(method = %request.method, url = %request.url, "forwarding to backend");
    let start = Instant::now();
    let result = state.backend.send(request).await;
    state.metrics.record_backend(
        &method,
        result.as_ref().ok().map(|r| r.status),
        start.elapsed(),
    );
    let backend_response = result?;

    if !backend_response.status.is_success() {
        warn!(
            method = %method,
            path = %uri.path(),
            status = backend_response.status.as_u16(),
            "backend returned a non-success status"
        );
    }

    let mut body = backend_response.body;
    if verb == Verb::Get && !body.is_empty() {
        body = decrypt_or_passthrough(state, body).await;
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = backend_response.status;
    *response.headers_mut() = copy_headers(
        &backend_response.headers,
        &RESPONSE_MANAGED_HEADERS,
        &[],
    );
    Ok(response)
}

async fn encrypt(state: &AppState, body: &[u8]) -> Result<Vec<u8>, TransformError> {
    let start = Instant::now();
    let result = state.transformer.encrypt(body).await;
    state
        .metrics
        .record_transform(TransformKind::Encrypt, result.is_ok(), start.elapsed());
    result
}

async fn decrypt_or_passthrough(state: &AppState, body: Bytes) -> Bytes {
    let start = Instant::now();
    let result = state.transformer.decrypt(&body).await;
    state
        .metrics
        .record_transform(TransformKind::Decrypt, result.is_ok(), start.elapsed());
    match result {
        Ok(plain) => Bytes::from(plain),
        Err(e) => {
            warn!(error = %e, "could not decrypt backend response, returning it unchanged");
            body
        }
    }
}

fn backend_url(base: &str, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    format!("{base}{path_and_query}")
}

fn copy_headers(from: &HeaderMap, managed: &[&str], ignored: &[HeaderName]) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(from.len());
    for (name, value) in from {
        if managed.contains(&name.as_str()) || ignored.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
