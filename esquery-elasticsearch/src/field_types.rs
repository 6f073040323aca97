//! Resolves the declared storage type of every metric field of an aggregation.

use std::{collections::BTreeMap, fmt};

use color_eyre::eyre::{Result, bail};
use serde::Deserialize;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::{QueryError, SchemaError, SearchEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Numeric(String),
    Text(String),
    Date,
    Boolean,
    Other(String),
}

impl FieldType {
    pub fn from_engine_type(name: &str) -> Self {
        match name {
            "long" | "integer" | "short" | "byte" | "double" | "float" | "half_float"
            | "scaled_float" | "unsigned_long" => FieldType::Numeric(name.to_string()),
            "text" | "keyword" | "constant_keyword" | "wildcard" | "match_only_text" => {
                FieldType::Text(name.to_string())
            }
            "date" | "date_nanos" => FieldType::Date,
            "boolean" => FieldType::Boolean,
            other => FieldType::Other(other.to_string()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Numeric(_))
    }

    fn same_kind(&self, other: &FieldType) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Numeric(name) | FieldType::Text(name) | FieldType::Other(name) => {
                f.write_str(name)
            }
            FieldType::Date => f.write_str("date"),
            FieldType::Boolean => f.write_str("boolean"),
        }
    }
}

pub type FieldTypes = BTreeMap<String, FieldType>;

#[derive(Debug, Deserialize)]
struct IndexFieldMappings {
    #[serde(default)]
    mappings: BTreeMap<String, FieldMappingEntry>,
}

#[derive(Debug, Deserialize)]
struct FieldMappingEntry {
    full_name: String,
    #[serde(default)]
    mapping: BTreeMap<String, FieldMappingDefinition>,
}

#[derive(Debug, Deserialize)]
struct FieldMappingDefinition {
    #[serde(rename = "type")]
    field_type: Option<String>,
}

/// Asks the engine for the types of `metric_fields` in every index matching `index`.
///
/// A count-only aggregation has no metric fields, in which case the engine isn't contacted at all.
#[instrument(skip(engine), name = "resolve field types")]
pub async fn resolve(
    engine: &dyn SearchEngine,
    index: &str,
    metric_fields: &[String],
) -> Result<FieldTypes> {
    if metric_fields.is_empty() {
        return Ok(FieldTypes::new());
    }

    let response = engine.field_mappings(index, metric_fields).await?;
    parse_field_mappings(index, metric_fields, response)
}

/// Picks the type of the literal field name out of one index's mapping entry, ignoring any
/// multi-field sub-variants (e.g. `name.keyword`).
fn literal_type(field: &str, entry: &FieldMappingEntry) -> Option<String> {
    let leaf = field.rsplit('.').next().unwrap_or(field);
    if let Some(def) = entry.mapping.get(leaf) {
        return def.field_type.clone();
    }

    let (name, def) = entry.mapping.iter().next()?;
    warn!(
        %field,
        "Field mapping has no '{leaf}' entry, using the mapping of '{name}' instead"
    );
    def.field_type.clone()
}

pub fn parse_field_mappings(
    index: &str,
    metric_fields: &[String],
    response: Value,
) -> Result<FieldTypes> {
    let indices: BTreeMap<String, IndexFieldMappings> = serde_json::from_value(response)
        .map_err(|e| QueryError::MalformedResponse(format!("field mappings: {e}")))?;

    if indices.is_empty() {
        bail!(SchemaError::NoMatchingIndices(index.to_string()));
    }

    let mut types = FieldTypes::new();

    for field in metric_fields {
        let mut resolved: Option<(&str, FieldType)> = None;

        // Indices are visited in name order, so the first index wins any conflict.
        for (index_name, mappings) in &indices {
            let Some(entry) = mappings.mappings.get(field) else {
                continue;
            };
            if entry.full_name != *field {
                continue;
            }
            let Some(type_name) = literal_type(field, entry) else {
                continue;
            };
            let field_type = FieldType::from_engine_type(&type_name);

            if let Some((first_index, first_type)) = &resolved {
                if !first_type.same_kind(&field_type) {
                    warn!(
                        %field,
                        "Conflicting field types: '{}' in '{}', '{}' in '{}', using '{}'",
                        first_type,
                        first_index,
                        field_type,
                        index_name,
                        first_type,
                    );
                }
            } else {
                resolved = Some((index_name.as_str(), field_type));
            }
        }

        let Some((_, field_type)) = resolved else {
            bail!(SchemaError::FieldNotFound {
                index: index.to_string(),
                field: field.clone(),
            });
        };
        types.insert(field.clone(), field_type);
    }

    Ok(types)
}
