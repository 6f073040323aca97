pub mod humantime_utils;
pub mod measurement_layer;
pub mod metrics;
pub mod run_at_interval;
pub mod shutdown_future;
