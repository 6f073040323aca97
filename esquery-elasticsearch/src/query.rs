//! Builds the search request of an aggregation and runs it against the engine.

use std::time::Duration;

use color_eyre::eyre::Result;
use esquery_common::metrics::OP_SEARCH;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::{SearchEngine, compile::AggregationTree, spec::AggregationSpec, with_deadline};

/// The `[start, end]` range queried on the aggregation's date field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl TimeWindow {
    pub fn ending_at(end: OffsetDateTime, length: Duration) -> Self {
        Self {
            start: end - length,
            end,
        }
    }
}

fn epoch_millis(dt: OffsetDateTime) -> i64 {
    (dt.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn build_search_body(
    spec: &AggregationSpec,
    tree: &AggregationTree,
    window: &TimeWindow,
) -> Value {
    let mut must = Vec::with_capacity(2);
    if !spec.filter_query.trim().is_empty() {
        must.push(json!({
            "query_string": {
                "query": spec.filter_query,
            }
        }));
    }
    must.push(json!({
        "range": {
            &spec.date_field: {
                "gte": epoch_millis(window.start),
                "lte": epoch_millis(window.end),
                "format": "epoch_millis",
            }
        }
    }));

    let mut body = Map::new();
    body.insert("size".to_string(), json!(0));
    body.insert("track_total_hits".to_string(), json!(true));
    body.insert("query".to_string(), json!({ "bool": { "must": must } }));
    if !tree.is_empty() {
        body.insert("aggs".to_string(), tree.to_json());
    }
    Value::Object(body)
}

#[instrument(skip_all, name = "execute aggregation query")]
pub async fn execute(
    engine: &dyn SearchEngine,
    spec: &AggregationSpec,
    tree: &AggregationTree,
    window: &TimeWindow,
    deadline: Instant,
) -> Result<Value> {
    let body = build_search_body(spec, tree, window);
    debug!(index = %spec.index, "Search body: {body}");
    with_deadline(deadline, OP_SEARCH, engine.search(&spec.index, &body)).await
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use crate::{
        compile::compile,
        field_types::{FieldType, FieldTypes},
        spec::MetricFunction,
    };

    use super::*;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    fn window() -> TimeWindow {
        TimeWindow::ending_at(NOW, Duration::from_secs(60))
    }

    #[test]
    fn window_ends_now() {
        let window = window();
        assert_eq!(window.end, NOW);
        assert_eq!(window.start, datetime!(2024-05-01 11:59:00 UTC));
    }

    #[test]
    fn filter_only_body_has_no_aggs() {
        let spec = AggregationSpec::new("logs_error", "*").with_filter("ERROR");
        let body = build_search_body(&spec, &AggregationTree::default(), &window());

        assert_eq!(
            body,
            json!({
                "size": 0,
                "track_total_hits": true,
                "query": { "bool": { "must": [
                    { "query_string": { "query": "ERROR" } },
                    { "range": { "@timestamp": {
                        "gte": 1714564740000i64,
                        "lte": 1714564800000i64,
                        "format": "epoch_millis",
                    }}},
                ]}},
            })
        );
    }

    #[test]
    fn empty_filter_is_left_out() {
        let mut spec = AggregationSpec::new("m", "i").with_filter("   ");
        spec.date_field = "time".to_string();
        let body = build_search_body(&spec, &AggregationTree::default(), &window());

        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 1);
        assert!(must[0]["range"]["time"].is_object());
    }

    #[test]
    fn aggregation_tree_is_attached() {
        let spec = AggregationSpec::new("m", "i")
            .with_tags(["URI"])
            .with_metrics(["response_time"], MetricFunction::Avg);
        let types = FieldTypes::from([(
            "response_time".to_string(),
            FieldType::Numeric("long".to_string()),
        )]);
        let tree = compile(&spec, &types).unwrap();

        let body = build_search_body(&spec, &tree, &window());

        assert_eq!(body["size"], json!(0));
        assert_eq!(body["aggs"], tree.to_json());
        assert_eq!(body["aggs"]["group_0"]["terms"]["field"], json!("URI"));
    }
}
