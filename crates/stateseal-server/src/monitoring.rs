//! Monitoring listener: liveness, readiness and Prometheus metrics.
//!
//! - `GET /liveness` answers as long as the process serves requests.
//! - `GET /readiness` probes the backend and relays its answer.
//! - `GET /metrics` renders the counters from [`Metrics`](crate::metrics::Metrics).

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::warn;

use crate::backend::BackendRequest;
use crate::metrics::Probe;
use crate::state::AppState;

/// Build the monitoring router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// `GET /liveness`
async fn liveness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.record_probe(Probe::Liveness, StatusCode::OK);
    (StatusCode::OK, "liveness OK")
}

/// `GET /readiness`: relays status and body of `GET {backend}{readiness_path}`.
async fn readiness(State(state): State<Arc<AppState>>) -> Response {
    let url = format!(
        "{}{}",
        state.settings.backend_url, state.settings.readiness_path
    );
    let request = BackendRequest {
        method: Method::GET,
        url,
        headers: HeaderMap::new(),
        body: Bytes::new(),
    };

    let (status, body) = match state.backend.send(request).await {
        Ok(resp) => (resp.status, resp.body),
        Err(e) => {
            warn!(error = %e, "readiness probe failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Bytes::from(e.to_string()),
            )
        }
    };
    state.metrics.record_probe(Probe::Readiness, status);
    (status, body).into_response()
}

/// `GET /metrics` in Prometheus text format.
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use stateseal_core::{DocumentTransformer, TransformError};
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    use super::*;
    use crate::backend::{BackendClient, BackendError, BackendResponse};
    use crate::config::ProxySettings;

    struct StubBackend {
        status: StatusCode,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BackendClient for StubBackend {
        async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
            self.urls.lock().await.push(request.url);
            Ok(BackendResponse {
                status: self.status,
                headers: HeaderMap::new(),
                body: Bytes::from_static(b"backend says hi"),
            })
        }
    }

    struct NoopTransformer;

    #[async_trait]
    impl DocumentTransformer for NoopTransformer {
        async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, TransformError> {
            Ok(plaintext.to_vec())
        }

        async fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, TransformError> {
            Ok(envelope.to_vec())
        }
    }

    fn state(status: StatusCode) -> (Arc<AppState>, Arc<StubBackend>) {
        let backend = Arc::new(StubBackend {
            status,
            urls: Mutex::new(Vec::new()),
        });
        let settings = ProxySettings {
            backend_url: "http://backend".to_owned(),
            lock_method: Method::from_bytes(b"LOCK").unwrap(),
            unlock_method: Method::from_bytes(b"UNLOCK").unwrap(),
            readiness_path: "/-/ready".to_owned(),
            ignored_request_headers: Vec::new(),
            max_body_bytes: 1024,
        };
        let state = Arc::new(AppState::new(
            settings,
            backend.clone(),
            Arc::new(NoopTransformer),
        ));
        (state, backend)
    }

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn liveness_is_ok() {
        let (state, _) = state(StatusCode::OK);
        let (status, body) = get_path(router(state), "/liveness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "liveness OK");
    }

    #[tokio::test]
    async fn readiness_relays_backend_answer() {
        let (state, backend) = state(StatusCode::SERVICE_UNAVAILABLE);
        let (status, body) = get_path(router(state), "/readiness").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "backend says hi");
        assert_eq!(*backend.urls.lock().await, vec!["http://backend/-/ready".to_owned()]);
    }

    #[tokio::test]
    async fn metrics_include_monitoring_counts() {
        let (state, _) = state(StatusCode::OK);
        let app = router(state);
        get_path(app.clone(), "/liveness").await;
        get_path(app.clone(), "/readiness").await;

        let (status, body) = get_path(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("stateseal_probe_requests_total{probe=\"liveness\",status=\"2xx\"} 1"));
        assert!(body.contains("stateseal_probe_requests_total{probe=\"readiness\",status=\"2xx\"} 1"));
    }
}
