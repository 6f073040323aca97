use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use esquery_common::{run_at_interval::run_at_interval, shutdown_future::ShutdownFuture};
use esquery_elasticsearch::{
    SearchEngine,
    cycle::{CycleOptions, CycleReport, run_cycle},
    record::RecordSink,
    spec::AggregationSpec,
};
use parking_lot::RwLock;
use tracing::{info, instrument};

/// Runs the configured aggregations against the engine and remembers how the last cycle went.
pub struct Poller {
    engine: Arc<dyn SearchEngine>,
    specs: Vec<AggregationSpec>,
    options: CycleOptions,
    sink: Arc<dyn RecordSink>,
    last_report: RwLock<Option<CycleReport>>,
}

impl Poller {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        specs: Vec<AggregationSpec>,
        options: CycleOptions,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            engine,
            specs,
            options,
            sink,
            last_report: RwLock::new(None),
        }
    }

    #[instrument(skip(self), name = "Poller run cycle")]
    pub async fn run_once(&self) -> CycleReport {
        let report = run_cycle(
            self.engine.as_ref(),
            &self.specs,
            &self.options,
            self.sink.as_ref(),
        )
        .await;
        *self.last_report.write() = Some(report.clone());
        report
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().clone()
    }
}

async fn poll_at_interval(weak_poller: Weak<Poller>, interval: Duration) {
    run_at_interval(
        async || {
            let Some(poller) = weak_poller.upgrade() else {
                return false;
            };
            poller.run_once().await;
            true
        },
        interval,
    )
    .await;
}

/// Runs a cycle right away, then again `interval` after each cycle finishes, until shut down or
/// the poller is dropped.
pub fn spawn_poller(poller: &Arc<Poller>, interval: Duration) -> ShutdownFuture {
    info!(
        specs = poller.specs.len(),
        "Polling every {}",
        humantime::format_duration(interval)
    );
    ShutdownFuture::new(
        poll_at_interval(Arc::downgrade(poller), interval),
        "Aggregation poller",
    )
}
