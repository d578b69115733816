//! In-process stand-in for the remote key service, used by tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::TransitConfig;

const ROLE_ID: &str = "test-role";
const SECRET_ID: &str = "test-secret";
const TOKEN: &str = "test-token";
const PREFIX: &str = "vault:v1:";

#[derive(Default)]
struct FakeState {
    logins: AtomicUsize,
    encrypts: AtomicUsize,
    failing_encrypts: AtomicUsize,
}

/// A fake transit service listening on an ephemeral local port.
///
/// Ciphertext is the plaintext with a `vault:v1:` prefix, which is enough to
/// exercise the wire protocol.
pub(crate) struct FakeVault {
    pub address: String,
    state: Arc<FakeState>,
    handle: JoinHandle<()>,
}

impl FakeVault {
    #[allow(clippy::unwrap_used)]
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/v1/auth/approle/login", post(login))
            .route("/v1/{mount}/encrypt/{name}", post(encrypt))
            .route("/v1/{mount}/decrypt/{name}", post(decrypt))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            address,
            state,
            handle,
        }
    }

    /// Transit settings that authenticate against this service, with
    /// millisecond retry waits.
    pub fn config(&self, key_name: &str) -> TransitConfig {
        let mut config = TransitConfig::new(&self.address, ROLE_ID, SECRET_ID, key_name);
        config.retry_wait_min = Duration::from_millis(5);
        config.retry_wait_max = Duration::from_millis(10);
        config
    }

    pub fn login_count(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    /// Encrypt requests received, including failed ones.
    pub fn encrypt_count(&self) -> usize {
        self.state.encrypts.load(Ordering::SeqCst)
    }

    /// Answer the next `count` encrypt requests with `503`.
    pub fn fail_next_encrypts(&self, count: usize) {
        self.state.failing_encrypts.store(count, Ordering::SeqCst);
    }

    /// Stop serving and wait until the listener is closed.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn login(
    State(state): State<Arc<FakeState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.logins.fetch_add(1, Ordering::SeqCst);
    if body["role_id"] != ROLE_ID || body["secret_id"] != SECRET_ID {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "errors": ["invalid role or secret ID"] })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "auth": { "client_token": TOKEN, "lease_duration": 3600 } })),
    )
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("x-vault-token")
        .is_some_and(|v| v.as_bytes() == TOKEN.as_bytes())
}

fn denied() -> (StatusCode, Json<Value>) {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "errors": ["permission denied"] })),
    )
}

async fn encrypt(
    State(state): State<Arc<FakeState>>,
    Path((_mount, _name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.encrypts.fetch_add(1, Ordering::SeqCst);
    if state
        .failing_encrypts
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "errors": ["Vault is sealed"] })),
        );
    }
    if !authorized(&headers) {
        return denied();
    }
    let plaintext = body["plaintext"].as_str().unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({ "data": { "ciphertext": format!("{PREFIX}{plaintext}") } })),
    )
}

async fn decrypt(
    Path((_mount, _name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return denied();
    }
    match body["ciphertext"].as_str().and_then(|c| c.strip_prefix(PREFIX)) {
        Some(plaintext) => (
            StatusCode::OK,
            Json(json!({ "data": { "plaintext": plaintext } })),
        ),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "errors": ["invalid ciphertext"] })),
        ),
    }
}
