use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramVec, IntCounterVec, IntGauge, exponential_buckets, register_histogram,
    register_histogram_vec, register_int_counter_vec, register_int_gauge,
};

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

// Search engine operation labels
pub const OP_FIELD_MAPPINGS: &str = "field_mappings";
pub const OP_SEARCH: &str = "search";
pub const OP_HEALTH_CHECK: &str = "health_check";

// Status labels
pub const STATUS_SUCCESS: &str = "success";
pub const ERROR_UNKNOWN: &str = "unknown_error";
pub const ERROR_SCHEMA: &str = "schema_error";
pub const ERROR_COMPILE: &str = "compile_error";
pub const ERROR_TRANSPORT: &str = "transport_error";
pub const ERROR_TIMEOUT: &str = "timeout_error";
pub const ERROR_PARTIAL_PARSE: &str = "partial_parse_error";

pub struct Metrics {
    pub cycle_duration: Histogram,
    pub running_pipelines: IntGauge,
    pub alive_nodes: IntGauge,
    pub downloaded_bytes: IntCounterVec,
    pub request_duration: HistogramVec,
    pub requests_total: IntCounterVec,
    pub request_errors_total: IntCounterVec,
    pub pipeline_errors_total: IntCounterVec,
    pub records_emitted_total: IntCounterVec,
    pub truncated_groupings_total: IntCounterVec,
}

/// From 0.05s to 508.798s
fn duration_buckets() -> Vec<f64> {
    exponential_buckets(0.05, 1.85, 15).unwrap()
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            cycle_duration: register_histogram!(
                "esquery_cycle_duration",
                "Duration of a full gather cycle over all aggregations",
                duration_buckets()
            )
            .expect("create cycle_duration"),

            running_pipelines: register_int_gauge!(
                "esquery_running_pipelines",
                "Number of aggregation pipelines currently running"
            )
            .expect("create running_pipelines"),

            alive_nodes: register_int_gauge!(
                "esquery_alive_nodes",
                "Number of search engine nodes that passed the last health check"
            )
            .expect("create alive_nodes"),

            downloaded_bytes: register_int_counter_vec!(
                "esquery_downloaded_bytes",
                "Number of bytes downloaded from the search engine",
                &["operation"],
            )
            .expect("create downloaded_bytes"),

            request_duration: register_histogram_vec!(
                "esquery_request_duration",
                "Duration of search engine requests in seconds",
                &["operation"],
                duration_buckets(),
            )
            .expect("create request_duration"),

            requests_total: register_int_counter_vec!(
                "esquery_requests_total",
                "Total number of search engine requests",
                &["operation", "status"]
            )
            .expect("create requests_total"),

            request_errors_total: register_int_counter_vec!(
                "esquery_request_errors_total",
                "Total number of failed search engine requests",
                &["operation", "error_type"]
            )
            .expect("create request_errors_total"),

            pipeline_errors_total: register_int_counter_vec!(
                "esquery_pipeline_errors_total",
                "Total number of failed aggregation pipelines",
                &["measurement", "error_type"]
            )
            .expect("create pipeline_errors_total"),

            records_emitted_total: register_int_counter_vec!(
                "esquery_records_emitted_total",
                "Number of records handed to the sink",
                &["measurement"]
            )
            .expect("create records_emitted_total"),

            truncated_groupings_total: register_int_counter_vec!(
                "esquery_truncated_groupings_total",
                "Number of groupings whose buckets were cut off by the bucket size cap",
                &["measurement"]
            )
            .expect("create truncated_groupings_total"),
        }
    }
}
