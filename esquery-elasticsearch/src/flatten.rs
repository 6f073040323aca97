//! Flattens a nested bucket-aggregation response into one record per terminal bucket.
//!
//! The walk is driven by the compiled [`AggregationTree`], never by the shape of the response:
//! at a grouping the response must hold that grouping's buckets, at a terminal bucket it must
//! hold every metric aggregation. Anything else is a partial parse, which rejects the whole
//! response.

use std::collections::BTreeMap;

use color_eyre::eyre::{Result, bail};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    QueryError,
    compile::{AggregationNode, AggregationTree, GroupingNode, MetricNode},
    record::{FieldValue, OutputRecord, normalize_tag_key},
};

pub const DOC_COUNT_FIELD: &str = "doc_count";

#[derive(Debug, Default, PartialEq)]
pub struct FlattenOutput {
    pub records: Vec<OutputRecord>,
    /// Number of groupings whose bucket list was cut off by the bucket size cap.
    pub truncated_groupings: usize,
}

/// Ordered `(tag, value)` pairs from the outermost grouping down to the current bucket.
type BucketPath = Vec<(String, String)>;

struct Walk<'a> {
    measurement: &'a str,
    timestamp: OffsetDateTime,
    output: FlattenOutput,
}

macro_rules! partial_parse {
    ($($arg:tt)*) => {
        bail!(QueryError::PartialParse(format!($($arg)*)))
    };
}

pub fn flatten(
    measurement: &str,
    tree: &AggregationTree,
    response: &Value,
    timestamp: OffsetDateTime,
) -> Result<FlattenOutput> {
    check_complete(response)?;
    let total = total_hits(response)?;

    let empty = Map::new();
    let aggregations = if tree.is_empty() {
        &empty
    } else {
        match response.get("aggregations") {
            Some(Value::Object(aggregations)) => aggregations,
            _ => partial_parse!("response has no aggregations"),
        }
    };

    let mut walk = Walk {
        measurement,
        timestamp,
        output: FlattenOutput::default(),
    };
    walk.nodes(&tree.roots, aggregations, total, &mut BucketPath::new())?;
    Ok(walk.output)
}

/// Rejects responses the engine answered only partially: aggregates computed over a subset of
/// the shards look valid but are wrong.
fn check_complete(response: &Value) -> Result<()> {
    if response.get("timed_out").and_then(Value::as_bool) == Some(true) {
        bail!(QueryError::SearchTimedOut);
    }

    let Some(shards) = response.get("_shards") else {
        return Ok(());
    };
    let failed = shards.get("failed").and_then(Value::as_u64).unwrap_or(0);
    if failed == 0 {
        return Ok(());
    }

    let total = shards.get("total").and_then(Value::as_u64).unwrap_or(failed);
    let reason = shards
        .get("failures")
        .and_then(|failures| failures.get(0))
        .and_then(|failure| failure.get("reason"))
        .map(|reason| match reason.get("reason") {
            Some(Value::String(inner)) => inner.clone(),
            _ => match reason {
                Value::String(reason) => reason.clone(),
                other => other.to_string(),
            },
        })
        .unwrap_or_else(|| "unknown reason".to_string());
    partial_parse!("{failed} of {total} shards failed: {reason}");
}

/// Total number of matching documents, either `{"value": n}` or a bare number on older engines.
fn total_hits(response: &Value) -> Result<u64> {
    let total = response.get("hits").and_then(|hits| hits.get("total"));
    let count = match total {
        Some(Value::Object(total)) => total.get("value").and_then(Value::as_u64),
        Some(value) => value.as_u64(),
        None => None,
    };
    match count {
        Some(count) => Ok(count),
        None => bail!(QueryError::MalformedResponse(
            "missing hits.total in search response".to_string()
        )),
    }
}

/// Renders a bucket key as a tag value. `None` means the bucket should be dropped.
fn bucket_tag_value(
    bucket: &Map<String, Value>,
    grouping: &GroupingNode,
) -> Result<Option<String>> {
    let rendered = match (bucket.get("key_as_string"), bucket.get("key")) {
        (Some(Value::String(s)), _) => s.clone(),
        (_, Some(Value::String(s))) => s.clone(),
        (_, Some(Value::Number(n))) => render_number(n),
        (_, Some(Value::Bool(b))) => b.to_string(),
        (_, other) => partial_parse!(
            "bucket of '{}' has an unusable key: {:?}",
            grouping.tag,
            other
        ),
    };

    if !rendered.is_empty() {
        return Ok(Some(rendered));
    }
    Ok(grouping.missing_value.clone())
}

fn render_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

impl Walk<'_> {
    fn nodes(
        &mut self,
        nodes: &[AggregationNode],
        payload: &Map<String, Value>,
        doc_count: u64,
        path: &mut BucketPath,
    ) -> Result<()> {
        let grouping = nodes.iter().find_map(|node| match node {
            AggregationNode::Grouping(grouping) => Some(grouping),
            AggregationNode::Metric(_) => None,
        });

        match grouping {
            Some(grouping) => self.grouping(grouping, payload, path),
            None => self.terminal(nodes, payload, doc_count, path),
        }
    }

    fn grouping(
        &mut self,
        grouping: &GroupingNode,
        payload: &Map<String, Value>,
        path: &mut BucketPath,
    ) -> Result<()> {
        let name = grouping.agg_name();
        let Some(agg) = payload.get(&name) else {
            partial_parse!("aggregation '{name}' for tag '{}' not found", grouping.tag);
        };
        let Some(buckets) = agg.get("buckets").and_then(Value::as_array) else {
            partial_parse!("aggregation '{name}' for tag '{}' has no buckets", grouping.tag);
        };

        if agg
            .get("sum_other_doc_count")
            .and_then(Value::as_u64)
            .is_some_and(|other| other > 0)
        {
            self.output.truncated_groupings += 1;
        }

        for bucket in buckets {
            let Some(bucket) = bucket.as_object() else {
                partial_parse!("bucket of '{}' is not an object", grouping.tag);
            };
            let Some(doc_count) = bucket.get(DOC_COUNT_FIELD).and_then(Value::as_u64) else {
                partial_parse!("bucket of '{}' has no doc_count", grouping.tag);
            };
            let Some(tag_value) = bucket_tag_value(bucket, grouping)? else {
                debug!(tag = %grouping.tag, "Skipping bucket with an empty key");
                continue;
            };

            path.push((grouping.tag.clone(), tag_value));
            let result = self.nodes(&grouping.children, bucket, doc_count, path);
            path.pop();
            result?;
        }

        Ok(())
    }

    fn terminal(
        &mut self,
        nodes: &[AggregationNode],
        payload: &Map<String, Value>,
        doc_count: u64,
        path: &BucketPath,
    ) -> Result<()> {
        let mut fields = BTreeMap::new();
        fields.insert(DOC_COUNT_FIELD.to_string(), FieldValue::Count(doc_count));

        for node in nodes {
            let AggregationNode::Metric(metric) = node else {
                continue;
            };
            if let Some(value) = metric_value(metric, payload)? {
                fields.insert(metric.output_field(), FieldValue::Float(value));
            }
        }

        let tags = path
            .iter()
            .map(|(tag, value)| (normalize_tag_key(tag), value.clone()))
            .collect();

        self.output.records.push(OutputRecord {
            measurement: self.measurement.to_string(),
            tags,
            fields,
            timestamp: self.timestamp,
        });
        Ok(())
    }
}

/// The computed value of a metric, `None` when the engine had nothing to compute it over.
fn metric_value(metric: &MetricNode, payload: &Map<String, Value>) -> Result<Option<f64>> {
    let name = metric.agg_name();
    let Some(agg) = payload.get(&name) else {
        partial_parse!(
            "aggregation '{name}' for metric '{}' not found",
            metric.output_field()
        );
    };
    match agg.get("value") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => partial_parse!(
            "metric '{}' has a non-numeric value: {other}",
            metric.output_field()
        ),
    }
}
