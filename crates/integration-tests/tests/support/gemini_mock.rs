#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use serde_json::{Value, json};

/// Gemini stand-in that answers every generateContent call with the same
/// status and body.
pub struct MockGeminiServer {
    pub base_url: String,
    hits: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Clone)]
struct MockState {
    status: StatusCode,
    body: Value,
    hits: Arc<AtomicUsize>,
}

impl MockGeminiServer {
    pub async fn failing_with(status: StatusCode) -> Self {
        Self::start(
            status,
            json!({ "error": { "code": status.as_u16(), "status": "INTERNAL" } }),
        )
        .await
    }

    pub async fn start(status: StatusCode, body: Value) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/models/{model_action}", post(generate_content))
            .with_state(MockState {
                status,
                body,
                hits: hits.clone(),
            });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("mock gemini listener should bind");
        let bind_addr = listener
            .local_addr()
            .expect("mock gemini listener local address should exist");

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("mock gemini server should run");
        });

        Self {
            base_url: format!("http://{bind_addr}/models"),
            hits,
            handle,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockGeminiServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn generate_content(State(state): State<MockState>) -> (StatusCode, Json<Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (state.status, Json(state.body))
}
