//! Enum types for Ledgerline entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// AGGREGATION LEVEL
// ============================================================================

/// Granularity at which a UDF's or report's fields are evaluated.
///
/// UDFs and reports of differing levels are incompatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationLevel {
    Deal,
    Group,
    Tranche,
}

impl AggregationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationLevel::Deal => "deal",
            AggregationLevel::Group => "group",
            AggregationLevel::Tranche => "tranche",
        }
    }

    pub fn all() -> &'static [AggregationLevel] {
        &[
            AggregationLevel::Deal,
            AggregationLevel::Group,
            AggregationLevel::Tranche,
        ]
    }
}

impl fmt::Display for AggregationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationLevel {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deal" => Ok(AggregationLevel::Deal),
            "group" => Ok(AggregationLevel::Group),
            "tranche" => Ok(AggregationLevel::Tranche),
            _ => Err(EnumParseError::new("aggregation level", s)),
        }
    }
}

// ============================================================================
// FIELD TYPE
// ============================================================================

/// Value type of a UDF field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }

    /// Check whether a JSON value is acceptable for this field type.
    ///
    /// `number` accepts integers too; `integer` rejects fractional values.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match (self, value) {
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Ok(FieldType::String),
            "integer" => Ok(FieldType::Integer),
            "number" => Ok(FieldType::Number),
            "boolean" => Ok(FieldType::Boolean),
            "array" => Ok(FieldType::Array),
            "object" => Ok(FieldType::Object),
            _ => Err(EnumParseError::new("field type", s)),
        }
    }
}

// ============================================================================
// CALCULATION PARAMETER TYPE
// ============================================================================

/// Declared type of a calculation parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// Free-form multi-line text (formulas)
    Text,
    /// One of a fixed list of options
    Select,
    /// Single-line string
    String,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Text => "text",
            ParamType::Select => "select",
            ParamType::String => "string",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error when parsing an unknown enum string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}
