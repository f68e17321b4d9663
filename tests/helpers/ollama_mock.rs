//! Mock Ollama server for exercising the HTTP generator.
//!
//! Binds an ephemeral port and answers `/api/generate` and `/api/tags`
//! according to its [`MockOllamaConfig`].

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct MockOllamaConfig {
    pub model: String,
    pub response: String,
    pub response_delay_ms: Option<u64>,
    /// Answer every generate call with this status
    pub fail_with: Option<StatusCode>,
    /// Report `done: false`
    pub incomplete: bool,
}

impl Default for MockOllamaConfig {
    fn default() -> Self {
        Self {
            model: "llama3.1:8b".to_string(),
            response: "Students mostly asked about fractions.".to_string(),
            response_delay_ms: None,
            fail_with: None,
            incomplete: false,
        }
    }
}

#[derive(Clone)]
pub struct MockOllamaServer {
    config: MockOllamaConfig,
    request_count: Arc<AtomicUsize>,
    last_request: Arc<Mutex<Option<Value>>>,
}

impl MockOllamaServer {
    pub fn new(config: MockOllamaConfig) -> Self {
        Self {
            config,
            request_count: Arc::new(AtomicUsize::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Start serving and return the base URL.
    pub async fn start(&self) -> String {
        let app = Router::new()
            .route("/api/generate", post(generate_handler))
            .route("/api/tags", get(tags_handler))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}")
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub async fn last_request(&self) -> Option<Value> {
        self.last_request.lock().await.clone()
    }
}

async fn tags_handler(State(server): State<MockOllamaServer>) -> Json<Value> {
    Json(json!({
        "models": [{ "name": server.config.model, "size": 4000000000u64 }]
    }))
}

#[derive(Deserialize)]
struct GenerateRequest {
    model: String,
}

async fn generate_handler(
    State(server): State<MockOllamaServer>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    server.request_count.fetch_add(1, Ordering::SeqCst);
    *server.last_request.lock().await = Some(body.clone());

    if let Some(delay) = server.config.response_delay_ms {
        tokio::time::sleep(tokio::time::Duration::from_millis(delay)).await;
    }
    if let Some(status) = server.config.fail_with {
        return Err(status);
    }

    let request: GenerateRequest =
        serde_json::from_value(body).map_err(|_| StatusCode::BAD_REQUEST)?;

    Ok(Json(json!({
        "model": request.model,
        "created_at": "2024-01-01T00:00:00Z",
        "response": server.config.response,
        "done": !server.config.incomplete,
    })))
}
