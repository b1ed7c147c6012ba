//! Shared fixtures: a canned embedding endpoint and config builders.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use serde_json::json;
use wiremock::{
    matchers::{method, path_regex},
    Mock, MockServer, Request, Respond, ResponseTemplate,
};

use crate::{MemoryConfig, ProviderSelection};

pub(crate) const TEST_DIMS: usize = 4;

/// OpenAI-shaped `/embeddings` endpoint that returns canned vectors for
/// known texts and stable derived vectors for everything else.
pub(crate) struct EmbeddingServer {
    pub server: MockServer,
    calls: Arc<AtomicUsize>,
}

struct EmbeddingResponder {
    calls: Arc<AtomicUsize>,
    vectors: HashMap<String, Vec<f32>>,
}

impl Respond for EmbeddingResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let body: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(value) => value,
            Err(_) => return ResponseTemplate::new(400),
        };
        let inputs: Vec<String> = body["input"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let data: Vec<serde_json::Value> = inputs
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let vector = self
                    .vectors
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| derived_vector(text));
                json!({ "index": index, "embedding": vector })
            })
            .collect();

        ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
    }
}

impl EmbeddingServer {
    pub(crate) async fn start() -> Self {
        Self::start_with(HashMap::new()).await
    }

    pub(crate) async fn start_with(vectors: HashMap<String, Vec<f32>>) -> Self {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));

        Mock::given(method("POST"))
            .and(path_regex("^/embeddings$"))
            .respond_with(EmbeddingResponder {
                calls: calls.clone(),
                vectors,
            })
            .mount(&server)
            .await;

        Self { server, calls }
    }

    pub(crate) fn url(&self) -> String {
        self.server.uri()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// `/embeddings` endpoint that always fails with the given status/body.
pub(crate) async fn failing_embedding_server(status: u16, body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex("^/embeddings$"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body.to_string()))
        .mount(&server)
        .await;
    server
}

struct GeminiResponder {
    calls: Arc<AtomicUsize>,
    vectors: HashMap<String, Vec<f32>>,
}

impl Respond for GeminiResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let body: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(value) => value,
            Err(_) => return ResponseTemplate::new(400),
        };
        let embeddings: Vec<serde_json::Value> = body["requests"]
            .as_array()
            .map(|requests| {
                requests
                    .iter()
                    .map(|entry| {
                        let text = entry
                            .pointer("/content/parts/0/text")
                            .and_then(|value| value.as_str())
                            .unwrap_or_default();
                        let vector = self
                            .vectors
                            .get(text)
                            .cloned()
                            .unwrap_or_else(|| derived_vector(text));
                        json!({ "values": vector })
                    })
                    .collect()
            })
            .unwrap_or_default();

        ResponseTemplate::new(200).set_body_json(json!({ "embeddings": embeddings }))
    }
}

/// Gemini-shaped `:batchEmbedContents` endpoint.
pub(crate) struct GeminiServer {
    pub server: MockServer,
    calls: Arc<AtomicUsize>,
}

impl GeminiServer {
    pub(crate) async fn start() -> Self {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));

        Mock::given(method("POST"))
            .and(path_regex(":batchEmbedContents$"))
            .respond_with(GeminiResponder {
                calls: calls.clone(),
                vectors: HashMap::new(),
            })
            .mount(&server)
            .await;

        Self { server, calls }
    }

    pub(crate) fn url(&self) -> String {
        self.server.uri()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Stable unit vector derived from the text, so unknown inputs embed
/// deterministically across calls and processes.
pub(crate) fn derived_vector(text: &str) -> Vec<f32> {
    let hash = blake3::hash(text.as_bytes());
    let bytes = hash.as_bytes();
    let mut vector: Vec<f32> = (0..TEST_DIMS)
        .map(|index| bytes[index % bytes.len()] as f32 / 255.0 + 0.01)
        .collect();

    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    for value in &mut vector {
        *value /= norm;
    }
    vector
}

/// Baseline config: OpenAI-compatible provider at the mock server, all
/// background triggers disabled so tests drive syncs explicitly.
pub(crate) fn test_config(workspace: &Path, server_url: &str) -> MemoryConfig {
    let mut config = MemoryConfig::default();
    config.workspace_dir = workspace.to_path_buf();
    config.provider.selection = ProviderSelection::Openai;
    config.provider.model = Some("test-embed".to_string());
    config.provider.openai.base_url = Some(server_url.to_string());
    config.provider.openai.api_key = Some("test-key".to_string());
    config.sync.watch = false;
    config.sync.on_search = false;
    config.sync.on_session_start = false;
    config
}

/// Raw connection onto a manager's store for row-level assertions.
pub(crate) fn open_raw(store_path: &Path) -> rusqlite::Connection {
    rusqlite::Connection::open(store_path).expect("store should be openable for inspection")
}

pub(crate) fn chunk_ids(conn: &rusqlite::Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT id FROM chunks ORDER BY path, start_line")
        .expect("prepare chunk id query");
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .expect("query chunk ids");
    rows.collect::<Result<Vec<_>, _>>().expect("read chunk ids")
}
