use std::{collections::BTreeSet, path::Path, time::Duration};

use color_eyre::eyre::{Context, Result, bail};
use esquery_common::humantime_utils::{deserialize_duration, serialize_duration};
use esquery_elasticsearch::{
    client::ElasticsearchConfig, cycle::CycleOptions, spec::AggregationSpec,
};
use serde::{Deserialize, Serialize};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_CONCURRENT_QUERIES: usize = 16;

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_max_concurrent_queries() -> usize {
    DEFAULT_MAX_CONCURRENT_QUERIES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub elasticsearch: ElasticsearchConfig,

    /// Time between the end of one cycle and the start of the next.
    #[serde(
        default = "default_interval",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,

    /// How many aggregation pipelines may query the engine at the same time.
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    pub aggregations: Vec<AggregationSpec>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.elasticsearch.validate()?;

        if self.interval.is_zero() {
            bail!("interval must be greater than zero");
        }
        if self.max_concurrent_queries == 0 {
            bail!("max_concurrent_queries must be greater than zero");
        }

        let mut names = BTreeSet::new();
        for spec in &self.aggregations {
            spec.validate()?;
            if !names.insert(spec.measurement_name.as_str()) {
                bail!(
                    "measurement_name '{}' is used by more than one aggregation",
                    spec.measurement_name
                );
            }
        }

        Ok(())
    }

    /// The cycle deadline is the engine request timeout.
    pub fn cycle_options(&self) -> CycleOptions {
        CycleOptions {
            timeout: self.elasticsearch.timeout,
            max_concurrent_queries: self.max_concurrent_queries,
        }
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(content).context("failed to parse config")?;
    config.validate().context("invalid config")?;
    Ok(config)
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("config: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use esquery_elasticsearch::{client::ElasticsearchAuth, spec::MetricFunction};
    use test_case::test_case;

    use super::*;

    const FULL_CONFIG: &str = r#"{
        "elasticsearch": {
            "urls": ["http://127.0.0.1:9200", "http://127.0.0.1:9201"],
            "auth": { "type": "basic", "username": "elastic", "password": "changeme" },
            "timeout": "10s"
        },
        "interval": "30s",
        "aggregations": [
            {
                "measurement_name": "nginx_logs",
                "index": "nginx-*",
                "date_field": "time",
                "query_period": "5m",
                "tags": ["URI", "status"],
                "metric_fields": ["response_time", "size"],
                "metric_function": "sum",
                "include_missing_tag": true,
                "missing_tag_value": "none"
            },
            {
                "measurement_name": "errors",
                "index": "*",
                "filter_query": "level:ERROR"
            }
        ]
    }"#;

    fn with_aggregations(aggregations: &str) -> String {
        format!(
            r#"{{
                "elasticsearch": {{ "urls": ["http://localhost:9200"] }},
                "aggregations": {aggregations}
            }}"#
        )
    }

    #[test]
    fn parses_full_config() {
        let config = parse_config(FULL_CONFIG).unwrap();

        assert_eq!(config.elasticsearch.urls.len(), 2);
        assert_eq!(
            config.elasticsearch.auth,
            ElasticsearchAuth::Basic {
                username: "elastic".to_string(),
                password: "changeme".to_string(),
            }
        );
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_queries, DEFAULT_MAX_CONCURRENT_QUERIES);

        let nginx = &config.aggregations[0];
        assert_eq!(nginx.query_window, Duration::from_secs(300));
        assert_eq!(nginx.metric_function, MetricFunction::Sum);
        assert!(nginx.include_missing_tag);

        let errors = &config.aggregations[1];
        assert!(errors.is_count_only());
        assert_eq!(errors.date_field, "@timestamp");

        let options = config.cycle_options();
        assert_eq!(options.timeout, Duration::from_secs(10));
    }

    #[test]
    fn defaults() {
        let config = parse_config(&with_aggregations("[]")).unwrap();
        assert_eq!(config.interval, DEFAULT_INTERVAL);
        assert_eq!(config.elasticsearch.timeout, Duration::from_secs(5));
        assert!(config.aggregations.is_empty());
    }

    #[test_case(
        r#"[{"measurement_name": "a", "index": "x"}, {"measurement_name": "a", "index": "y"}]"#
        ; "duplicate measurement"
    )]
    #[test_case(r#"[{"measurement_name": "", "index": "x"}]"# ; "empty measurement")]
    #[test_case(r#"[{"measurement_name": "a", "index": ""}]"# ; "empty index")]
    #[test_case(
        r#"[{"measurement_name": "a", "index": "x", "query_window": "0s"}]"#
        ; "zero window"
    )]
    #[test_case(
        r#"[{"measurement_name": "a", "index": "x", "metric_function": "median"}]"#
        ; "unknown function"
    )]
    #[test_case(
        r#"[{"measurement_name": "a", "index": "x", "tags": ["h", "h"]}]"#
        ; "duplicate tag"
    )]
    fn rejects_invalid_aggregations(aggregations: &str) {
        assert!(parse_config(&with_aggregations(aggregations)).is_err());
    }

    #[test]
    fn rejects_missing_urls() {
        let err = parse_config(r#"{ "elasticsearch": { "urls": [] }, "aggregations": [] }"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("at least one elasticsearch url"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let content = r#"{
            "elasticsearch": { "urls": ["http://localhost:9200"] },
            "max_concurrent_queries": 0,
            "aggregations": []
        }"#;
        assert!(parse_config(content).is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_config("/nonexistent/esquery.json").unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
