//! Runs every aggregation of a cycle concurrently and reports what each produced.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use color_eyre::eyre::Result;
use esquery_common::{
    humantime_utils::serialize_duration,
    metrics::{METRICS, OP_FIELD_MAPPINGS},
};
use futures_util::{FutureExt, StreamExt, stream};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    ErrorKind, SearchEngine,
    compile::{MAX_BUCKETS, compile},
    field_types,
    flatten::{FlattenOutput, flatten},
    query::{self, TimeWindow},
    record::{RecordSink, serialize_timestamp},
    spec::AggregationSpec,
    with_deadline,
};

static NEXT_CYCLE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct CycleOptions {
    /// Shared by every network call of the cycle, measured from its start.
    pub timeout: Duration,
    pub max_concurrent_queries: usize,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_concurrent_queries: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecError {
    pub measurement: String,
    /// `None` for failures outside the known taxonomy.
    pub kind: Option<ErrorKind>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    #[serde(serialize_with = "serialize_timestamp")]
    pub started_at: OffsetDateTime,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub specs: usize,
    pub records_emitted: usize,
    pub truncated_groupings: usize,
    pub errors: Vec<SpecError>,
}

async fn run_pipeline(
    engine: &dyn SearchEngine,
    spec: &AggregationSpec,
    deadline: Instant,
    now: OffsetDateTime,
) -> Result<FlattenOutput> {
    METRICS.running_pipelines.inc();
    let _running = scopeguard::guard((), |_| {
        METRICS.running_pipelines.dec();
    });

    let field_types = with_deadline(
        deadline,
        OP_FIELD_MAPPINGS,
        field_types::resolve(engine, &spec.index, &spec.metric_fields),
    )
    .await?;

    let tree = compile(spec, &field_types)?;
    debug!(depth = tree.depth(), "Compiled aggregation tree");

    let window = TimeWindow::ending_at(now, spec.query_window);
    let response = query::execute(engine, spec, &tree, &window, deadline).await?;

    flatten(&spec.measurement_name, &tree, &response, now)
}

async fn run_spec<'a>(
    engine: &'a dyn SearchEngine,
    spec: &'a AggregationSpec,
    deadline: Instant,
    now: OffsetDateTime,
) -> (&'a AggregationSpec, Result<FlattenOutput>) {
    let span = info_span!("pipeline", measurement = %spec.measurement_name);
    let result = run_pipeline(engine, spec, deadline, now)
        .instrument(span)
        .await;
    (spec, result)
}

/// Runs one pipeline per aggregation, at most `max_concurrent_queries` at a time.
///
/// A failing aggregation never affects the others. Records reach `sink` only once every pipeline
/// has finished, and an aggregation that failed contributes none.
pub async fn run_cycle(
    engine: &dyn SearchEngine,
    specs: &[AggregationSpec],
    options: &CycleOptions,
    sink: &dyn RecordSink,
) -> CycleReport {
    let cycle = NEXT_CYCLE.fetch_add(1, Ordering::Relaxed);
    let span = info_span!("cycle", cycle);

    async move {
        let start = Instant::now();
        let now = OffsetDateTime::now_utc();
        let deadline = start + options.timeout;
        info!(specs = specs.len(), "Starting cycle");

        let results: Vec<(&AggregationSpec, Result<FlattenOutput>)> = stream::iter(
            specs
                .iter()
                .map(|spec| run_spec(engine, spec, deadline, now).boxed())
                .collect::<Vec<_>>(),
        )
        .buffer_unordered(options.max_concurrent_queries.max(1))
            .collect()
            .await;

        let mut report = CycleReport {
            cycle,
            started_at: now,
            duration: Duration::ZERO,
            specs: specs.len(),
            records_emitted: 0,
            truncated_groupings: 0,
            errors: Vec::new(),
        };

        for (spec, result) in results {
            let measurement = spec.measurement_name.as_str();
            match result {
                Ok(output) => {
                    if output.truncated_groupings > 0 {
                        warn!(
                            %measurement,
                            truncated = output.truncated_groupings,
                            "Groupings exceeded {MAX_BUCKETS} buckets, the rest were dropped"
                        );
                        METRICS
                            .truncated_groupings_total
                            .with_label_values(&[measurement])
                            .inc_by(output.truncated_groupings as u64);
                    }

                    METRICS
                        .records_emitted_total
                        .with_label_values(&[measurement])
                        .inc_by(output.records.len() as u64);
                    report.records_emitted += output.records.len();
                    report.truncated_groupings += output.truncated_groupings;

                    for record in output.records {
                        sink.add_record(record);
                    }
                }
                Err(e) => {
                    error!(%measurement, "Aggregation pipeline failed: {e:#}");
                    METRICS
                        .pipeline_errors_total
                        .with_label_values(&[measurement, ErrorKind::label_of(&e)])
                        .inc();
                    sink.add_error(measurement, &e);
                    report.errors.push(SpecError {
                        measurement: measurement.to_string(),
                        kind: ErrorKind::of(&e),
                        message: format!("{e:#}"),
                    });
                }
            }
        }

        report
            .errors
            .sort_by(|a, b| a.measurement.cmp(&b.measurement));
        report.duration = start.elapsed();
        METRICS
            .cycle_duration
            .observe(report.duration.as_secs_f64());

        info!(
            records = report.records_emitted,
            errors = report.errors.len(),
            "Cycle finished in {:?}",
            report.duration
        );
        report
    }
    .instrument(span)
    .await
}
