mod common;

use std::{sync::Arc, time::Duration};

use color_eyre::{Report, Result, eyre::bail};
use ctor::ctor;
use esquery_elasticsearch::{cycle::CycleOptions, record::MemorySink, spec::AggregationSpec};
use esquery_server::{
    http_server::create_axum_app,
    poller::{Poller, spawn_poller},
};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_retry::{Retry, strategy::FixedInterval};

use common::{MockEngine, init_test_tracing};

#[ctor]
fn init() {
    init_test_tracing();
}

struct Server {
    url: String,
    poller: Arc<Poller>,
    sink: Arc<MemorySink>,
    _engine: MockEngine,
}

async fn start_server() -> Server {
    let engine = MockEngine::start().await.with_search(
        "logs-*",
        json!({ "hits": { "total": { "value": 42, "relation": "eq" }, "hits": [] } }),
    );
    let sink = Arc::new(MemorySink::new());
    let poller = Arc::new(Poller::new(
        Arc::new(engine.client()),
        vec![
            AggregationSpec::new("errors", "logs-*").with_filter("level:ERROR"),
            AggregationSpec::new("gone", "gone-*"),
        ],
        CycleOptions::default(),
        sink.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let app = create_axum_app(poller.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        url,
        poller,
        sink,
        _engine: engine,
    }
}

#[tokio::test]
async fn health_returns_ok() {
    let server = start_server().await;
    let response = reqwest::get(format!("{}/health", server.url)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn last_cycle_before_first_cycle_is_not_found() {
    let server = start_server().await;
    let response = reqwest::get(format!("{}/last_cycle", server.url))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn last_cycle_reports_records_and_errors() -> Result<()> {
    let server = start_server().await;
    let _poller_task = spawn_poller(&server.poller, Duration::from_secs(60));

    let report: Value = Retry::spawn(FixedInterval::from_millis(20).take(100), || async {
        let response = reqwest::get(format!("{}/last_cycle", server.url)).await?;
        if response.status() != StatusCode::OK {
            bail!("no cycle yet: {}", response.status());
        }
        Ok::<Value, Report>(response.json().await?)
    })
    .await?;

    assert_eq!(report["specs"], json!(2));
    assert_eq!(report["records_emitted"], json!(1));
    assert_eq!(report["errors"][0]["measurement"], json!("gone"));
    assert_eq!(report["errors"][0]["kind"], json!("schema"));
    assert_eq!(server.sink.records()[0].measurement, "errors");
    Ok(())
}

#[tokio::test]
async fn metrics_are_exposed() {
    let server = start_server().await;
    server.poller.run_once().await;

    let response = reqwest::get(format!("{}/metrics", server.url))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.text().await.unwrap();
    assert!(body.contains("esquery_cycle_duration"));
    assert!(body.contains("esquery_records_emitted_total"));
    assert!(body.contains(
        r#"esquery_pipeline_errors_total{error_type="schema_error",measurement="gone"}"#
    ));
}
