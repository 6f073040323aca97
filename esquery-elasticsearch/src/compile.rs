//! Compiles an [`AggregationSpec`] into a tree of nested grouping and metric aggregations.
//!
//! The first tag is the outermost grouping, every following tag nests inside the previous one,
//! and metric leaves hang under the innermost grouping (or at the top level when there are no
//! tags). The same tree later guides the flattener through the response.

use color_eyre::eyre::{Result, bail};
use serde_json::{Map, Value, json};

use crate::{
    CompileError, SchemaError,
    field_types::FieldTypes,
    spec::{AggregationSpec, MetricFunction},
};

/// Number of distinct buckets requested per grouping.
pub const MAX_BUCKETS: usize = 1000;

const GROUPING_AGG_PREFIX: &str = "group_";
const METRIC_AGG_PREFIX: &str = "metric_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationNode {
    Grouping(GroupingNode),
    Metric(MetricNode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingNode {
    /// The field being grouped on, which is also the tag name of the output records.
    pub tag: String,
    pub depth: usize,
    pub size: usize,
    /// Label of the synthetic bucket collecting documents that lack `tag`.
    pub missing_value: Option<String>,
    pub children: Vec<AggregationNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricNode {
    pub field: String,
    pub function: MetricFunction,
    pub position: usize,
}

impl GroupingNode {
    /// Name of this aggregation in the request and response. Never a user field name, those
    /// could collide with bucket properties such as `key` or `doc_count`.
    pub fn agg_name(&self) -> String {
        format!("{GROUPING_AGG_PREFIX}{}", self.depth)
    }

    pub fn grouping_child(&self) -> Option<&GroupingNode> {
        grouping_of(&self.children)
    }

    fn to_json(&self) -> Value {
        let mut terms = Map::new();
        terms.insert("field".to_string(), json!(self.tag));
        terms.insert("size".to_string(), json!(self.size));
        if let Some(missing) = &self.missing_value {
            terms.insert("missing".to_string(), json!(missing));
        }

        let mut agg = Map::new();
        agg.insert("terms".to_string(), Value::Object(terms));
        if !self.children.is_empty() {
            agg.insert("aggs".to_string(), nodes_to_json(&self.children));
        }
        Value::Object(agg)
    }
}

impl MetricNode {
    pub fn agg_name(&self) -> String {
        format!("{METRIC_AGG_PREFIX}{}", self.position)
    }

    /// Field name of the computed value in output records, e.g. `response_time_avg`.
    pub fn output_field(&self) -> String {
        format!("{}_{}", self.field, self.function)
    }

    fn to_json(&self) -> Value {
        json!({ self.function.engine_aggregation(): { "field": self.field } })
    }
}

impl AggregationNode {
    pub fn agg_name(&self) -> String {
        match self {
            AggregationNode::Grouping(node) => node.agg_name(),
            AggregationNode::Metric(node) => node.agg_name(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            AggregationNode::Grouping(node) => node.to_json(),
            AggregationNode::Metric(node) => node.to_json(),
        }
    }
}

fn grouping_of(nodes: &[AggregationNode]) -> Option<&GroupingNode> {
    nodes.iter().find_map(|node| match node {
        AggregationNode::Grouping(grouping) => Some(grouping),
        AggregationNode::Metric(_) => None,
    })
}

fn nodes_to_json(nodes: &[AggregationNode]) -> Value {
    Value::Object(
        nodes
            .iter()
            .map(|node| (node.agg_name(), node.to_json()))
            .collect(),
    )
}

/// The nodes attached directly to the search request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregationTree {
    pub roots: Vec<AggregationNode>,
}

impl AggregationTree {
    /// An empty tree means the request is a plain filtered document count.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of nested grouping levels.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = grouping_of(&self.roots);
        while let Some(node) = current {
            depth += 1;
            current = node.grouping_child();
        }
        depth
    }

    /// The metric leaves, wherever they hang.
    pub fn metrics(&self) -> Vec<&MetricNode> {
        let mut nodes = &self.roots;
        while let Some(grouping) = grouping_of(nodes) {
            nodes = &grouping.children;
        }
        nodes
            .iter()
            .filter_map(|node| match node {
                AggregationNode::Metric(metric) => Some(metric),
                AggregationNode::Grouping(_) => None,
            })
            .collect()
    }

    /// The `aggs` object of the search request body.
    pub fn to_json(&self) -> Value {
        nodes_to_json(&self.roots)
    }
}

pub fn compile(spec: &AggregationSpec, field_types: &FieldTypes) -> Result<AggregationTree> {
    for field in &spec.metric_fields {
        let Some(field_type) = field_types.get(field) else {
            bail!(SchemaError::FieldNotFound {
                index: spec.index.clone(),
                field: field.clone(),
            });
        };
        if !field_type.is_numeric() {
            bail!(CompileError::NonNumericField {
                field: field.clone(),
                field_type: field_type.clone(),
                function: spec.metric_function,
            });
        }
    }

    let mut nodes: Vec<AggregationNode> = spec
        .metric_fields
        .iter()
        .enumerate()
        .map(|(position, field)| {
            AggregationNode::Metric(MetricNode {
                field: field.clone(),
                function: spec.metric_function,
                position,
            })
        })
        .collect();

    let missing_value = spec
        .include_missing_tag
        .then(|| spec.missing_tag_value.clone());

    // Built inside out: the last tag wraps the metrics, the first tag ends up outermost.
    for (depth, tag) in spec.tags.iter().enumerate().rev() {
        nodes = vec![AggregationNode::Grouping(GroupingNode {
            tag: tag.clone(),
            depth,
            size: MAX_BUCKETS,
            missing_value: missing_value.clone(),
            children: nodes,
        })];
    }

    Ok(AggregationTree { roots: nodes })
}
