//! Mock HTTP server setup for integration tests

#![allow(dead_code)]

use chatlink::client::RetryPolicy;
use chatlink::{ChatClient, ChatClientBuilder, ClientConfig};
use mockito::{Mock, Server, ServerGuard};
use std::time::Duration;

pub const API_KEY: &str = "sk-or-v1-test0123456789abcdef";

/// Test fixture that owns a mock server.
pub struct MockServerFixture {
    pub server: ServerGuard,
}

impl MockServerFixture {
    pub async fn new() -> Self {
        Self {
            server: Server::new_async().await,
        }
    }

    /// Config pointed at the mock server, with fast retries and no env influence.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::default();
        config.base_url = self.server.url();
        config.timeout = Duration::from_secs(5);
        config.retry = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_jitter(false);
        config
    }

    pub async fn client(&self) -> ChatClient {
        self.client_with(self.config()).await
    }

    pub async fn client_with(&self, config: ClientConfig) -> ChatClient {
        ChatClientBuilder::new()
            .with_api_key(API_KEY)
            .with_config(config)
            .build()
            .await
            .expect("client builds against mock server")
    }

    /// A JSON response on `POST /chat/completions`, expected exactly `hits` times.
    pub async fn mock_chat(&mut self, status: usize, body: &str, hits: usize) -> Mock {
        self.server
            .mock("POST", "/chat/completions")
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .expect(hits)
            .create_async()
            .await
    }

    /// An SSE response built from `data:` payloads, one frame per entry.
    pub async fn mock_sse(&mut self, payloads: &[&str], hits: usize) -> Mock {
        let body: String = payloads
            .iter()
            .map(|p| format!("data: {}\n\n", p))
            .collect();
        self.server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .expect(hits)
            .create_async()
            .await
    }

    pub async fn mock_get(&mut self, path: &str, body: &str) -> Mock {
        self.server
            .mock("GET", path)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }
}

pub fn completion(model: &str, content: &str) -> String {
    serde_json::json!({
        "id": "gen-123",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
    })
    .to_string()
}

pub fn chunk(content: &str) -> String {
    serde_json::json!({
        "id": "gen-1",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    })
    .to_string()
}

pub const MODELS_BODY: &str = r#"{
  "data": [
    {"id": "acme/big", "name": "Acme Big", "context_length": 200000,
     "pricing": {"prompt": "0.00001", "completion": "0.00003"},
     "supported_parameters": ["tools"]},
    {"id": "acme/small", "name": "Acme Small", "context_length": 32000,
     "pricing": {"prompt": "0.0000001", "completion": "0.0000002"}},
    {"id": "acme/tiny", "name": "Acme Tiny", "context_length": 8000,
     "pricing": {"prompt": "0.0000001", "completion": "0.0000002"}},
    {"id": "acme/router", "pricing": {"prompt": "-1", "completion": "-1"}}
  ]
}"#;
