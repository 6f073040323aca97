use std::{io, sync::Arc};

use color_eyre::eyre::{Context, Result, bail};
use esquery::args::parse_args;
use esquery_common::measurement_layer::{MeasurementJsonFormat, MeasurementLayer};
use esquery_elasticsearch::{
    SearchEngine,
    client::ElasticsearchClient,
    record::{JsonLinesSink, RecordSink},
};
use esquery_server::{
    config::load_config,
    http_server::create_axum_app,
    poller::{Poller, spawn_poller},
};
use mimalloc::MiMalloc;
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("SIGINT/Ctrl+C received, starting graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        // Kubernetes, Docker, systemd, etc...
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        sigterm.recv().await;
        info!("SIGTERM received, starting graceful shutdown");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    // Stdout carries the records.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(MeasurementLayer::new())
            .with(
                fmt::layer()
                    .event_format(MeasurementJsonFormat)
                    .with_writer(io::stderr),
            )
            .init();

        color_eyre::config::HookBuilder::default()
            .theme(color_eyre::config::Theme::new())
            .install()?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
        color_eyre::install()?;
    }

    info!(?args, "Init");

    let config = load_config(&args.config)?;
    info!(
        aggregations = config.aggregations.len(),
        "Loaded config from {}",
        args.config.display()
    );

    let client = Arc::new(
        ElasticsearchClient::new(config.elasticsearch.clone())
            .context("create elasticsearch client")?,
    );
    let engine: Arc<dyn SearchEngine> = client.clone();
    let sink: Arc<dyn RecordSink> = Arc::new(JsonLinesSink::new(io::stdout()));
    let poller = Arc::new(Poller::new(
        engine,
        config.aggregations.clone(),
        config.cycle_options(),
        sink,
    ));

    if args.once {
        let report = poller.run_once().await;
        client.close().await;
        if !report.errors.is_empty() {
            bail!(
                "{} of {} aggregations failed",
                report.errors.len(),
                report.specs
            );
        }
        return Ok(());
    }

    let poller_task = spawn_poller(&poller, config.interval);

    let app = create_axum_app(poller);
    let listener = TcpListener::bind(&args.listen).await?;

    info!("Listening on {}", args.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum serve")?;

    poller_task.shutdown().await;
    client.close().await;

    Ok(())
}
