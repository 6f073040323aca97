//! Declarative description of one aggregation query, as read from the configuration file.

use std::{fmt, time::Duration};

use color_eyre::eyre::{Result, bail};
use esquery_common::humantime_utils::{deserialize_duration, serialize_duration};
use serde::{Deserialize, Serialize};

use crate::record::normalize_tag_key;

pub const DEFAULT_DATE_FIELD: &str = "@timestamp";
pub const DEFAULT_MISSING_TAG_VALUE: &str = "null";

fn default_date_field() -> String {
    DEFAULT_DATE_FIELD.to_string()
}

fn default_missing_tag_value() -> String {
    DEFAULT_MISSING_TAG_VALUE.to_string()
}

fn default_query_window() -> Duration {
    Duration::from_secs(60)
}

/// The metric aggregation applied to every metric field of an aggregation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricFunction {
    #[default]
    Avg,
    Sum,
    Min,
    Max,
    Count,
}

impl MetricFunction {
    /// Name of the metric aggregation in the engine's query DSL.
    pub fn engine_aggregation(&self) -> &'static str {
        match self {
            MetricFunction::Avg => "avg",
            MetricFunction::Sum => "sum",
            MetricFunction::Min => "min",
            MetricFunction::Max => "max",
            MetricFunction::Count => "value_count",
        }
    }
}

impl fmt::Display for MetricFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricFunction::Avg => "avg",
            MetricFunction::Sum => "sum",
            MetricFunction::Min => "min",
            MetricFunction::Max => "max",
            MetricFunction::Count => "count",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregationSpec {
    pub measurement_name: String,

    /// Index name or pattern (e.g. `nginxlogs-*`).
    pub index: String,

    /// Query-string filter, empty means match everything.
    #[serde(default)]
    pub filter_query: String,

    #[serde(default = "default_date_field")]
    pub date_field: String,

    #[serde(
        default = "default_query_window",
        alias = "query_period",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub query_window: Duration,

    /// Fields to group by, outermost first.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Fields to aggregate, empty means only document counts are collected.
    #[serde(default)]
    pub metric_fields: Vec<String>,

    #[serde(default)]
    pub metric_function: MetricFunction,

    #[serde(default)]
    pub include_missing_tag: bool,

    #[serde(default = "default_missing_tag_value")]
    pub missing_tag_value: String,
}

impl AggregationSpec {
    pub fn new(measurement_name: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            measurement_name: measurement_name.into(),
            index: index.into(),
            filter_query: String::new(),
            date_field: default_date_field(),
            query_window: default_query_window(),
            tags: Vec::new(),
            metric_fields: Vec::new(),
            metric_function: MetricFunction::default(),
            include_missing_tag: false,
            missing_tag_value: default_missing_tag_value(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metrics<I, S>(mut self, fields: I, function: MetricFunction) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metric_fields = fields.into_iter().map(Into::into).collect();
        self.metric_function = function;
        self
    }

    pub fn with_missing_tag(mut self, value: impl Into<String>) -> Self {
        self.include_missing_tag = true;
        self.missing_tag_value = value.into();
        self
    }

    pub fn with_filter(mut self, filter_query: impl Into<String>) -> Self {
        self.filter_query = filter_query.into();
        self
    }

    /// Whether the query degenerates into a filtered document count.
    pub fn is_count_only(&self) -> bool {
        self.tags.is_empty() && self.metric_fields.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.measurement_name.trim().is_empty() {
            bail!("aggregation is missing a measurement_name");
        }
        let name = &self.measurement_name;
        if self.index.trim().is_empty() {
            bail!("aggregation '{name}': index must not be empty");
        }
        if self.date_field.trim().is_empty() {
            bail!("aggregation '{name}': date_field must not be empty");
        }
        if self.query_window.is_zero() {
            bail!("aggregation '{name}': query_window must be greater than zero");
        }
        if let Some(tag) = self.tags.iter().find(|t| t.trim().is_empty()) {
            bail!("aggregation '{name}': empty tag name '{tag}'");
        }
        if let Some(field) = self.metric_fields.iter().find(|f| f.trim().is_empty()) {
            bail!("aggregation '{name}': empty metric field name '{field}'");
        }
        for (i, tag) in self.tags.iter().enumerate() {
            let key = normalize_tag_key(tag);
            let Some(earlier) = self.tags[..i].iter().find(|t| normalize_tag_key(t) == key) else {
                continue;
            };
            if earlier == tag {
                bail!("aggregation '{name}': tag '{tag}' is listed more than once");
            }
            bail!("aggregation '{name}': tags '{earlier}' and '{tag}' both become tag key '{key}'");
        }
        Ok(())
    }
}
