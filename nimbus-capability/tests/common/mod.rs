// In-process control plane stub for the HTTP client tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use nimbus_capability::signing::{verify, HEADER_API_KEY, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use nimbus_capability::HttpControlPlane;
use nimbus_core::config::ControlPlaneConfig;
use parking_lot::Mutex;

pub const API_KEY: &str = "test-key";
pub const API_SECRET: &str = "test-secret";

#[derive(Debug, Clone)]
pub struct Received {
    pub method: String,
    pub path: String,
    pub body: String,
    pub api_key: String,
    pub signature_valid: bool,
}

/// Replies with queued responses in order, then with the fallback.
pub struct StubServer {
    pub addr: SocketAddr,
    state: Arc<StubState>,
}

struct StubState {
    responses: Mutex<VecDeque<(StatusCode, String)>>,
    fallback: Mutex<(StatusCode, String)>,
    received: Mutex<Vec<Received>>,
}

impl StubServer {
    pub async fn start() -> Self {
        let state = Arc::new(StubState {
            responses: Mutex::new(VecDeque::new()),
            fallback: Mutex::new((
                StatusCode::OK,
                r#"{"code":0,"message":"ok","data":{"task_id":"t-1"}}"#.to_string(),
            )),
            received: Mutex::new(Vec::new()),
        });

        let app = Router::new().fallback(handle).with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn respond(&self, status: u16, body: &str) {
        self.state
            .responses
            .lock()
            .push_back((StatusCode::from_u16(status).unwrap(), body.to_string()));
    }

    pub fn respond_always(&self, status: u16, body: &str) {
        *self.state.fallback.lock() = (StatusCode::from_u16(status).unwrap(), body.to_string());
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.received.lock().len()
    }

    pub fn client(&self, max_retries: u32, failure_threshold: u32) -> HttpControlPlane {
        self.client_with_open_window(max_retries, failure_threshold, Duration::from_secs(60))
    }

    pub fn client_with_open_window(
        &self,
        max_retries: u32,
        failure_threshold: u32,
        open_duration: Duration,
    ) -> HttpControlPlane {
        HttpControlPlane::new(&ControlPlaneConfig {
            base_url: self.base_url(),
            api_key: API_KEY.to_string(),
            api_secret: API_SECRET.to_string(),
            timeout: Duration::from_secs(5),
            max_retries,
            retry_backoff: Duration::from_millis(1),
            circuit_failure_threshold: failure_threshold,
            circuit_open_duration: open_duration,
        })
        .unwrap()
    }
}

async fn handle(
    State(state): State<Arc<StubState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let signature_valid = verify(
        API_SECRET,
        method.as_str(),
        uri.path(),
        &header(HEADER_TIMESTAMP),
        &body,
        &header(HEADER_SIGNATURE),
    );

    state.received.lock().push(Received {
        method: method.to_string(),
        path: uri.path().to_string(),
        body: String::from_utf8_lossy(&body).into_owned(),
        api_key: header(HEADER_API_KEY),
        signature_valid,
    });

    let next = state.responses.lock().pop_front();
    next.unwrap_or_else(|| state.fallback.lock().clone())
}
