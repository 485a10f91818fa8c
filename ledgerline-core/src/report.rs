//! Report layouts, qualified field references and run payloads.

use crate::{AggregationLevel, CycleCode, ReportId, UdfId, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One result row, keyed by qualified field name plus primary-model columns.
pub type Row = Map<String, Value>;

/// Parsed `"<udf_name>.<field_name>"` reference.
///
/// Split at the first `.`; the field part may itself contain dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedField {
    pub udf: String,
    pub field: String,
}

impl QualifiedField {
    pub fn new(udf: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            udf: udf.into(),
            field: field.into(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        match value.split_once('.') {
            Some((udf, field)) if !udf.is_empty() && !field.is_empty() => {
                Ok(Self::new(udf, field))
            }
            _ => Err(ValidationError::InvalidQualifiedField {
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for QualifiedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.udf, self.field)
    }
}

impl FromStr for QualifiedField {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Free-form layout document. `fields` is the only key this crate reads;
/// anything else the backend stores is carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LayoutJson {
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LayoutJson {
    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            extra: Map::new(),
        }
    }
}

/// A persisted report layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportLayout {
    pub id: ReportId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub primary_model: String,
    pub aggregation_level: AggregationLevel,
    #[serde(default)]
    pub udf_ids: Vec<UdfId>,
    #[serde(default)]
    pub layout_json: LayoutJson,
}

impl ReportLayout {
    /// Selected qualified field names, in export order.
    pub fn fields(&self) -> &[String] {
        &self.layout_json.fields
    }

    pub fn references_udf(&self, udf_id: UdfId) -> bool {
        self.udf_ids.contains(&udf_id)
    }

    pub fn to_payload(&self) -> ReportLayoutCreate {
        ReportLayoutCreate {
            name: self.name.clone(),
            description: self.description.clone(),
            primary_model: self.primary_model.clone(),
            aggregation_level: self.aggregation_level,
            udf_ids: self.udf_ids.clone(),
            layout_json: self.layout_json.clone(),
        }
    }

    /// Reject a replacement document that changes the aggregation level.
    pub fn check_update(&self, payload: &ReportLayoutCreate) -> Result<(), ValidationError> {
        if payload.aggregation_level != self.aggregation_level {
            return Err(ValidationError::ImmutableField {
                field: "aggregation_level".to_string(),
            });
        }
        Ok(())
    }
}

/// Wire payload for report create and full-document replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportLayoutCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub primary_model: String,
    pub aggregation_level: AggregationLevel,
    pub udf_ids: Vec<UdfId>,
    pub layout_json: LayoutJson,
}

impl ReportLayoutCreate {
    pub fn fields(&self) -> &[String] {
        &self.layout_json.fields
    }

    pub fn into_layout(self, id: ReportId) -> ReportLayout {
        ReportLayout {
            id,
            name: self.name,
            description: self.description,
            primary_model: self.primary_model,
            aggregation_level: self.aggregation_level,
            udf_ids: self.udf_ids,
            layout_json: self.layout_json,
        }
    }
}

/// Body of `POST /reports/run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRunRequest {
    pub report_id: ReportId,
    pub cycle_code: CycleCode,
    /// Equality filters on primary-model columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<BTreeMap<String, Value>>,
}

impl ReportRunRequest {
    pub fn new(report_id: ReportId, cycle_code: CycleCode) -> Self {
        Self {
            report_id,
            cycle_code,
            filters: None,
        }
    }

    pub fn with_filter(mut self, column: impl Into<String>, value: Value) -> Self {
        self.filters
            .get_or_insert_with(BTreeMap::new)
            .insert(column.into(), value);
        self
    }
}

/// Response of `POST /reports/run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRunResponse {
    pub report_name: String,
    pub cycle_code: CycleCode,
    #[serde(default)]
    pub data: Vec<Row>,
}
