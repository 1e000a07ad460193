//! Test helpers: scripted HTTP stubs on ephemeral ports.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{Router, extract::State, http::StatusCode};

/// Default success body: one string rate, one numeric rate.
pub const RATES_BODY: &str = r#"{"base":"USD","rates":{"EUR":"0.92","GBP":0.79}}"#;

#[derive(Clone)]
struct Script {
    calls: Arc<AtomicUsize>,
    statuses: Arc<Vec<u16>>,
    body: &'static str,
}

/// HTTP server answering the n-th request with the n-th scripted status
/// (repeating the last one once the script runs out).
pub struct StatusScript {
    base_url: String,
    calls: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl StatusScript {
    pub async fn spawn(statuses: Vec<u16>) -> Self {
        Self::spawn_with_body(statuses, RATES_BODY).await
    }

    pub async fn spawn_with_body(statuses: Vec<u16>, body: &'static str) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let script = Script {
            calls: calls.clone(),
            statuses: Arc::new(statuses),
            body,
        };

        let app = Router::new().fallback(respond).with_state(script);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            calls,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Drop for StatusScript {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn respond(State(script): State<Script>) -> (StatusCode, [(&'static str, &'static str); 1], &'static str) {
    let n = script.calls.fetch_add(1, Ordering::SeqCst);
    let code = script
        .statuses
        .get(n)
        .or_else(|| script.statuses.last())
        .copied()
        .unwrap_or(200);
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
    let body = if status.is_success() { script.body } else { "{}" };
    (status, [("content-type", "application/json")], body)
}

/// URL of a port nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/rates/USD")
}
