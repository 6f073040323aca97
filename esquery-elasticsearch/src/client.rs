use std::{
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::BytesMut;
use color_eyre::eyre::{Context, Result, bail, eyre};
use esquery_common::{
    humantime_utils::{deserialize_duration, serialize_duration},
    metrics::{METRICS, OP_FIELD_MAPPINGS, OP_HEALTH_CHECK, OP_SEARCH},
    run_at_interval::run_at_interval,
    shutdown_future::ShutdownFuture,
};
use parking_lot::RwLock;
use reqwest::{Certificate, Client, RequestBuilder, Response, Url, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    QueryError, SchemaError, SearchEngine,
    instrumentation::{instrument_operation, record_operation_result},
};

const MIN_SUPPORTED_MAJOR_VERSION: u32 = 7;
const OPENSEARCH_DISTRIBUTION: &str = "opensearch";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElasticsearchAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        key: String,
    },
}

impl ElasticsearchAuth {
    fn apply_to_request(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            ElasticsearchAuth::None => req,
            ElasticsearchAuth::Basic { username, password } => {
                let credentials = format!("{username}:{password}");
                let encoded = BASE64.encode(credentials);
                req.header(header::AUTHORIZATION, format!("Basic {encoded}"))
            }
            ElasticsearchAuth::ApiKey { key } => {
                req.header(header::AUTHORIZATION, format!("ApiKey {key}"))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TlsConfig {
    /// PEM file of an additional root certificate to trust.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElasticsearchConfig {
    pub urls: Vec<String>,

    #[serde(default)]
    pub auth: ElasticsearchAuth,

    /// Per request timeout.
    #[serde(
        default = "default_timeout",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,

    /// Zero disables health checking, all nodes are then always considered alive.
    #[serde(
        default = "default_health_check_interval",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub health_check_interval: Duration,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl ElasticsearchConfig {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            auth: ElasticsearchAuth::None,
            timeout: default_timeout(),
            health_check_interval: default_health_check_interval(),
            tls: TlsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            bail!("at least one elasticsearch url is required");
        }
        for url in &self.urls {
            Url::parse(url).with_context(|| format!("invalid elasticsearch url '{url}'"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct NodeVersion {
    number: String,
    #[serde(default)]
    distribution: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    version: NodeVersion,
}

/// The configured nodes and whether each passed its last health check.
#[derive(Debug)]
struct Nodes {
    urls: Vec<String>,
    alive: RwLock<Vec<bool>>,
}

impl Nodes {
    fn new(urls: &[String]) -> Self {
        let urls: Vec<String> = urls
            .iter()
            .map(|url| url.trim_end_matches('/').to_string())
            .collect();
        let alive = RwLock::new(vec![true; urls.len()]);
        METRICS.alive_nodes.set(urls.len() as i64);
        Self { urls, alive }
    }

    /// Node indices in the order a request should try them: alive nodes round-robin starting at
    /// `next`, or every node in order when none is alive.
    fn candidates(&self, next: &AtomicUsize) -> Vec<usize> {
        let alive = self.alive.read();
        let alive_nodes: Vec<usize> = (0..self.urls.len()).filter(|&i| alive[i]).collect();
        if alive_nodes.is_empty() {
            return (0..self.urls.len()).collect();
        }

        let start = next.fetch_add(1, Ordering::Relaxed) % alive_nodes.len();
        alive_nodes[start..]
            .iter()
            .chain(&alive_nodes[..start])
            .copied()
            .collect()
    }

    fn mark(&self, node: usize, is_alive: bool) {
        let mut alive = self.alive.write();
        if alive[node] != is_alive {
            if is_alive {
                info!(url = %self.urls[node], "Node is alive");
            } else {
                warn!(url = %self.urls[node], "Node is dead");
            }
        }
        alive[node] = is_alive;
        METRICS
            .alive_nodes
            .set(alive.iter().filter(|x| **x).count() as i64);
    }
}

/// [`SearchEngine`] over the Elasticsearch (or OpenSearch) REST API.
#[derive(Debug)]
pub struct ElasticsearchClient {
    config: ElasticsearchConfig,
    nodes: Arc<Nodes>,
    next_node: AtomicUsize,
    health_check_task: Option<ShutdownFuture>,
    client: Client,
}

fn build_http_client(config: &ElasticsearchConfig) -> Result<Client> {
    let mut builder = Client::builder().timeout(config.timeout);

    if let Some(path) = &config.tls.ca_cert {
        let pem = std::fs::read(path)
            .with_context(|| format!("read CA certificate '{}'", path.display()))?;
        let cert = Certificate::from_pem(&pem).context("parse CA certificate")?;
        builder = builder.add_root_certificate(cert);
    }

    if config.tls.insecure_skip_verify {
        warn!("TLS certificate verification is disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().context("build http client")
}

async fn response_to_bytes(response: Response, operation: &str) -> Result<BytesMut> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!(QueryError::ServerResp(status.as_u16(), text));
    }
    let bytes = response.bytes().await.map_err(QueryError::Http)?;
    METRICS
        .downloaded_bytes
        .with_label_values(&[operation])
        .inc_by(bytes.len() as u64);
    Ok(bytes.into())
}

#[instrument(skip(req), name = "elasticsearch send_request")]
async fn send_request(req: RequestBuilder, operation: &str) -> Result<BytesMut> {
    match req.send().await {
        Ok(response) => response_to_bytes(response, operation).await,
        Err(e) => Err(eyre!(QueryError::Http(e))),
    }
}

fn parse_response<T>(mut bytes: BytesMut, operation: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    simd_json::serde::from_slice(bytes.as_mut())
        .map_err(|e| eyre!(QueryError::MalformedResponse(format!("{operation}: {e}"))))
}

fn is_connect_error(report: &color_eyre::Report) -> bool {
    matches!(report.downcast_ref::<QueryError>(), Some(QueryError::Http(e)) if e.is_connect())
}

/// A concrete index that doesn't exist is a 404 rather than an empty response.
fn is_index_not_found(report: &color_eyre::Report) -> bool {
    matches!(
        report.downcast_ref::<QueryError>(),
        Some(QueryError::ServerResp(404, text)) if text.contains("index_not_found_exception")
    )
}

fn check_version(version: &NodeVersion) -> Result<()> {
    if version.distribution.as_deref() == Some(OPENSEARCH_DISTRIBUTION) {
        return Ok(());
    }

    let Some(major) = version
        .number
        .split('.')
        .next()
        .and_then(|major| major.parse::<u32>().ok())
    else {
        bail!("unparsable version number '{}'", version.number);
    };

    if major < MIN_SUPPORTED_MAJOR_VERSION {
        bail!(
            "unsupported elasticsearch version {}, need {}.x or newer",
            version.number,
            MIN_SUPPORTED_MAJOR_VERSION
        );
    }
    Ok(())
}

#[instrument(skip(client, auth), name = "elasticsearch health check")]
async fn check_node(client: &Client, url: &str, auth: &ElasticsearchAuth) -> Result<()> {
    let start = std::time::Instant::now();

    let result: Result<()> = async {
        let req = auth.apply_to_request(client.get(url));
        let bytes = send_request(req, OP_HEALTH_CHECK).await?;
        let info: NodeInfo = parse_response(bytes, OP_HEALTH_CHECK)?;
        check_version(&info.version)
    }
    .await;

    let duration = start.elapsed().as_secs_f64();
    record_operation_result(OP_HEALTH_CHECK, &result, duration);
    result
}

async fn check_nodes_at_interval(
    client: Client,
    auth: ElasticsearchAuth,
    weak_nodes: Weak<Nodes>,
    interval: Duration,
) {
    run_at_interval(
        async || {
            let Some(nodes) = weak_nodes.upgrade() else {
                return false;
            };

            for (i, url) in nodes.urls.iter().enumerate() {
                match check_node(&client, url, &auth).await {
                    Ok(()) => nodes.mark(i, true),
                    Err(e) => {
                        error!(%url, "Elasticsearch health check failed: {:#}", e);
                        nodes.mark(i, false);
                    }
                }
            }

            true
        },
        interval,
    )
    .await;
}

impl ElasticsearchClient {
    /// Must be called from within a tokio runtime, health checking runs as a background task.
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        config.validate()?;

        let client = build_http_client(&config)?;
        let nodes = Arc::new(Nodes::new(&config.urls));

        let health_check_task = (!config.health_check_interval.is_zero()).then(|| {
            ShutdownFuture::new(
                check_nodes_at_interval(
                    client.clone(),
                    config.auth.clone(),
                    Arc::downgrade(&nodes),
                    config.health_check_interval,
                ),
                "Elasticsearch health checker",
            )
        });

        Ok(Self {
            config,
            nodes,
            next_node: AtomicUsize::new(0),
            health_check_task,
            client,
        })
    }

    /// Sends a request built by `build` for a node url, moving on to the next node while nodes
    /// can't be connected to.
    async fn request<F>(&self, operation: &'static str, index: &str, build: F) -> Result<Value>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        instrument_operation(operation, || async {
            let mut last_error = None;

            for node in self.nodes.candidates(&self.next_node) {
                let url = &self.nodes.urls[node];
                let req = self.config.auth.apply_to_request(build(&self.client, url));

                match send_request(req, operation).await {
                    Ok(bytes) => return parse_response(bytes, operation),
                    Err(e) if is_connect_error(&e) => {
                        warn!(%url, "Failed to connect to node, trying the next one: {:#}", e);
                        self.nodes.mark(node, false);
                        last_error = Some(e);
                    }
                    Err(e) if is_index_not_found(&e) => {
                        bail!(SchemaError::NoMatchingIndices(index.to_string()));
                    }
                    Err(e) => return Err(e),
                }
            }

            Err(last_error.unwrap_or_else(|| eyre!("no elasticsearch nodes configured")))
        })
        .await
    }

    #[instrument(skip(self), name = "Elasticsearch close")]
    pub async fn close(&self) {
        if let Some(task) = &self.health_check_task {
            task.shutdown().await;
        }
    }
}

#[async_trait]
impl SearchEngine for ElasticsearchClient {
    #[instrument(skip(self), name = "elasticsearch field mappings")]
    async fn field_mappings(&self, index: &str, fields: &[String]) -> Result<Value> {
        let fields = fields.join(",");
        self.request(OP_FIELD_MAPPINGS, index, |client, url| {
            client.get(format!("{url}/{index}/_mapping/field/{fields}"))
        })
        .await
    }

    #[instrument(skip(self, body), name = "elasticsearch search")]
    async fn search(&self, index: &str, body: &Value) -> Result<Value> {
        debug!("Searching '{index}'");
        self.request(OP_SEARCH, index, |client, url| {
            client.post(format!("{url}/{index}/_search")).json(body)
        })
        .await
    }
}
