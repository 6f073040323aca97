#![allow(dead_code)]

//! An in-process stand-in for the Elasticsearch REST endpoints the client talks to.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use esquery_elasticsearch::client::{ElasticsearchClient, ElasticsearchConfig};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};

pub fn init_test_tracing() {
    color_eyre::install().unwrap();
    tracing_subscriber::fmt().with_test_writer().init();
}

#[derive(Debug)]
pub struct MockState {
    pub root: Mutex<Value>,
    pub mappings: Mutex<BTreeMap<String, Value>>,
    pub searches: Mutex<BTreeMap<String, Value>>,
    pub search_delay: Mutex<Option<Duration>>,
    /// `(index, body)` of every search received.
    pub search_requests: Mutex<Vec<(String, Value)>>,
    pub auth_headers: Mutex<Vec<Option<String>>>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            root: Mutex::new(json!({
                "name": "mock",
                "version": { "number": "8.11.0" },
                "tagline": "You Know, for Search",
            })),
            mappings: Mutex::default(),
            searches: Mutex::default(),
            search_delay: Mutex::default(),
            search_requests: Mutex::default(),
            auth_headers: Mutex::default(),
        }
    }
}

pub struct MockEngine {
    pub url: String,
    pub state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl MockEngine {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());

        let app = Router::new()
            .route("/", get(root))
            .route("/:index/_mapping/field/:fields", get(field_mappings))
            .route("/:index/_search", post(search))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, state, server }
    }

    pub fn with_mappings(self, index: &str, response: Value) -> Self {
        self.state
            .mappings
            .lock()
            .insert(index.to_string(), response);
        self
    }

    pub fn with_search(self, index: &str, response: Value) -> Self {
        self.state
            .searches
            .lock()
            .insert(index.to_string(), response);
        self
    }

    pub fn config(&self) -> ElasticsearchConfig {
        let mut config = ElasticsearchConfig::new(vec![self.url.clone()]);
        config.health_check_interval = Duration::ZERO;
        config
    }

    pub fn client(&self) -> ElasticsearchClient {
        ElasticsearchClient::new(self.config()).unwrap()
    }

    pub fn search_requests(&self) -> Vec<(String, Value)> {
        self.state.search_requests.lock().clone()
    }
}

/// A url nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    url
}

fn index_not_found(index: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": {
                "root_cause": [{ "type": "index_not_found_exception", "index": index }],
                "type": "index_not_found_exception",
                "reason": format!("no such index [{index}]"),
            },
            "status": 404,
        })),
    )
        .into_response()
}

fn record_auth(state: &MockState, headers: &HeaderMap) {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.auth_headers.lock().push(auth);
}

async fn root(State(state): State<Arc<MockState>>) -> Response {
    Json(state.root.lock().clone()).into_response()
}

async fn field_mappings(
    State(state): State<Arc<MockState>>,
    Path((index, _fields)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    record_auth(&state, &headers);
    let mapping = state.mappings.lock().get(&index).cloned();
    match mapping {
        Some(mapping) => Json(mapping).into_response(),
        None => index_not_found(&index),
    }
}

async fn search(
    State(state): State<Arc<MockState>>,
    Path(index): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record_auth(&state, &headers);
    state.search_requests.lock().push((index.clone(), body));

    let delay = *state.search_delay.lock();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let response = state.searches.lock().get(&index).cloned();
    match response {
        Some(response) => Json(response).into_response(),
        None => index_not_found(&index),
    }
}

pub fn field_mapping(index: &str, fields: &[(&str, &str)]) -> Value {
    let mappings: serde_json::Map<String, Value> = fields
        .iter()
        .map(|(name, field_type)| {
            let leaf = name.rsplit('.').next().unwrap_or(name);
            (
                name.to_string(),
                json!({ "full_name": name, "mapping": { leaf: { "type": field_type } } }),
            )
        })
        .collect();
    json!({ index: { "mappings": mappings } })
}
