use std::time::Instant;

use color_eyre::eyre::Result;
use esquery_common::metrics::{METRICS, STATUS_SUCCESS};

use crate::ErrorKind;

pub fn record_operation_result<T>(operation: &str, result: &Result<T>, duration: f64) {
    METRICS
        .request_duration
        .with_label_values(&[operation])
        .observe(duration);

    match result {
        Ok(_) => {
            METRICS
                .requests_total
                .with_label_values(&[operation, STATUS_SUCCESS])
                .inc();
        }
        Err(e) => {
            let error_type = ErrorKind::label_of(e);
            METRICS
                .requests_total
                .with_label_values(&[operation, error_type])
                .inc();
            METRICS
                .request_errors_total
                .with_label_values(&[operation, error_type])
                .inc();
        }
    }
}

pub async fn instrument_operation<F, Fut, T>(operation: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = f().await;
    let duration = start.elapsed().as_secs_f64();

    record_operation_result(operation, &result, duration);
    result
}
