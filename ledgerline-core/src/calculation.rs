//! Calculation metadata and the typed calculation parameter union.
//!
//! The backend publishes, per aggregation level, which calculation kinds
//! exist and which parameters each one declares. Field definitions carry
//! their parameters on the wire as a loose `name -> value` map; this module
//! turns that map into a [`Calculation`] by checking it against the
//! [`CalculationDefinition`] resolved at runtime.

use crate::{AggregationLevel, ParamType, ValidationError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Wire form of calculation parameters.
pub type ParamMap = BTreeMap<String, Value>;

// ============================================================================
// REGISTRY METADATA
// ============================================================================

/// One declared parameter of a calculation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationParam {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    /// Allowed values; present iff `param_type` is `select`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Registry-provided description of a calculation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationDefinition {
    #[serde(rename = "type")]
    pub calculation_type: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// Level this kind applies to. `None` means every level.
    #[serde(default)]
    pub level: Option<AggregationLevel>,
    #[serde(default)]
    pub params: Vec<CalculationParam>,
}

impl CalculationDefinition {
    pub fn param(&self, name: &str) -> Option<&CalculationParam> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn applies_to(&self, level: AggregationLevel) -> bool {
        self.level.map_or(true, |l| l == level)
    }

    /// Parameter map holding only the declared defaults.
    pub fn default_params(&self) -> ParamMap {
        self.params
            .iter()
            .filter_map(|p| p.default.clone().map(|v| (p.name.clone(), v)))
            .collect()
    }
}

/// The calculation kinds resolved for one aggregation level.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationCatalog {
    level: AggregationLevel,
    definitions: Vec<CalculationDefinition>,
}

impl CalculationCatalog {
    /// Build a catalog for `level`, dropping definitions scoped to other levels.
    pub fn new(level: AggregationLevel, definitions: Vec<CalculationDefinition>) -> Self {
        let definitions = definitions
            .into_iter()
            .filter(|d| d.applies_to(level))
            .collect();
        Self { level, definitions }
    }

    /// Catalog with no calculations available.
    pub fn empty(level: AggregationLevel) -> Self {
        Self {
            level,
            definitions: Vec::new(),
        }
    }

    /// Catalog of the built-in calculation kinds for `level`.
    pub fn builtin(level: AggregationLevel) -> Self {
        Self::new(level, BUILTIN_DEFINITIONS.clone())
    }

    pub fn level(&self) -> AggregationLevel {
        self.level
    }

    pub fn get(&self, calculation_type: &str) -> Option<&CalculationDefinition> {
        self.definitions
            .iter()
            .find(|d| d.calculation_type == calculation_type)
    }

    pub fn contains(&self, calculation_type: &str) -> bool {
        self.get(calculation_type).is_some()
    }

    pub fn definitions(&self) -> &[CalculationDefinition] {
        &self.definitions
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

// ============================================================================
// TYPED PARAMETERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumParams {
    pub related_model: String,
    pub field_to_sum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AverageParams {
    pub related_model: String,
    pub field_to_average: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountParams {
    pub related_model: String,
}

/// Falls back to the field's `source_field` when the target is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinParams {
    pub field_to_min: Option<String>,
}

/// Falls back to the field's `source_field` when the target is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxParams {
    pub field_to_max: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomParams {
    pub formula: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Static,
    ModelField,
}

impl MappingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingKind::Static => "static",
            MappingKind::ModelField => "model_field",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "static" => Some(MappingKind::Static),
            "model_field" => Some(MappingKind::ModelField),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingParams {
    pub mapping_type: MappingKind,
    pub mapping_value: Option<String>,
    pub source_model: Option<String>,
    pub source_field: Option<String>,
    pub relation_field: Option<String>,
}

/// A calculation with its parameters decoded into a per-kind struct.
///
/// Kinds the registry publishes but this crate has no struct for decode
/// into [`Calculation::Dynamic`], still checked against the declared params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Calculation {
    Sum(SumParams),
    Average(AverageParams),
    Count(CountParams),
    Min(MinParams),
    Max(MaxParams),
    Custom(CustomParams),
    Mapping(MappingParams),
    Dynamic {
        calculation_type: String,
        params: BTreeMap<String, String>,
    },
}

impl Calculation {
    pub fn calculation_type(&self) -> &str {
        match self {
            Calculation::Sum(_) => "sum",
            Calculation::Average(_) => "average",
            Calculation::Count(_) => "count",
            Calculation::Min(_) => "min",
            Calculation::Max(_) => "max",
            Calculation::Custom(_) => "custom",
            Calculation::Mapping(_) => "mapping",
            Calculation::Dynamic {
                calculation_type, ..
            } => calculation_type,
        }
    }

    /// Encode back into the wire parameter map. Absent optionals are omitted.
    pub fn to_params(&self) -> ParamMap {
        let mut params = ParamMap::new();
        let mut put = |name: &str, value: Option<&String>| {
            if let Some(value) = value {
                params.insert(name.to_string(), Value::String(value.clone()));
            }
        };
        match self {
            Calculation::Sum(p) => {
                put("related_model", Some(&p.related_model));
                put("field_to_sum", Some(&p.field_to_sum));
            }
            Calculation::Average(p) => {
                put("related_model", Some(&p.related_model));
                put("field_to_average", Some(&p.field_to_average));
            }
            Calculation::Count(p) => put("related_model", Some(&p.related_model)),
            Calculation::Min(p) => put("field_to_min", p.field_to_min.as_ref()),
            Calculation::Max(p) => put("field_to_max", p.field_to_max.as_ref()),
            Calculation::Custom(p) => put("formula", Some(&p.formula)),
            Calculation::Mapping(p) => {
                let kind = p.mapping_type.as_str().to_string();
                put("mapping_type", Some(&kind));
                put("mapping_value", p.mapping_value.as_ref());
                put("source_model", p.source_model.as_ref());
                put("source_field", p.source_field.as_ref());
                put("relation_field", p.relation_field.as_ref());
            }
            Calculation::Dynamic { params: raw, .. } => {
                for (name, value) in raw {
                    put(name, Some(value));
                }
            }
        }
        params
    }

    /// Decode a wire parameter map against the definition resolved from the
    /// registry.
    ///
    /// Checks, in order: required parameters are present, every key is
    /// declared, every value is a string and select values are among the
    /// declared options. `field` is only used for error context.
    pub fn decode(
        definition: &CalculationDefinition,
        field: &str,
        params: &ParamMap,
    ) -> Result<Calculation, ValidationError> {
        let calculation_type = definition.calculation_type.as_str();

        for param in definition.params.iter().filter(|p| p.required) {
            if !is_present(params.get(&param.name)) {
                return Err(ValidationError::MissingCalculationParam {
                    field: field.to_string(),
                    calculation_type: calculation_type.to_string(),
                    param: param.name.clone(),
                });
            }
        }

        let mut checked = BTreeMap::new();
        for (name, value) in params {
            let Some(param) = definition.param(name) else {
                return Err(ValidationError::UnknownCalculationParam {
                    field: field.to_string(),
                    calculation_type: calculation_type.to_string(),
                    param: name.clone(),
                });
            };
            if value.is_null() {
                continue;
            }
            let invalid = |reason: String| ValidationError::InvalidCalculationParam {
                field: field.to_string(),
                calculation_type: calculation_type.to_string(),
                param: name.clone(),
                reason,
            };
            let Value::String(text) = value else {
                return Err(invalid(format!("expected {} value", param.param_type)));
            };
            if param.param_type == ParamType::Select {
                let options = param.options.as_deref().unwrap_or_default();
                if !options.iter().any(|o| o == text) {
                    return Err(invalid(format!(
                        "'{}' is not one of [{}]",
                        text,
                        options.join(", ")
                    )));
                }
            }
            checked.insert(name.clone(), text.clone());
        }

        let decoder = Decoder {
            definition,
            field,
            checked: &checked,
        };
        decoder.build()
    }
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// Builds typed params from checked values, falling back to declared defaults.
struct Decoder<'a> {
    definition: &'a CalculationDefinition,
    field: &'a str,
    checked: &'a BTreeMap<String, String>,
}

impl Decoder<'_> {
    fn optional(&self, name: &str) -> Option<String> {
        self.checked.get(name).cloned().or_else(|| {
            self.definition
                .param(name)
                .and_then(|p| p.default.as_ref())
                .and_then(|v| v.as_str().map(str::to_string))
        })
    }

    fn required(&self, name: &str) -> Result<String, ValidationError> {
        self.optional(name)
            .ok_or_else(|| ValidationError::MissingCalculationParam {
                field: self.field.to_string(),
                calculation_type: self.definition.calculation_type.clone(),
                param: name.to_string(),
            })
    }

    fn build(&self) -> Result<Calculation, ValidationError> {
        let calculation = match self.definition.calculation_type.as_str() {
            "sum" => Calculation::Sum(SumParams {
                related_model: self.required("related_model")?,
                field_to_sum: self.required("field_to_sum")?,
            }),
            "average" => Calculation::Average(AverageParams {
                related_model: self.required("related_model")?,
                field_to_average: self.required("field_to_average")?,
            }),
            "count" => Calculation::Count(CountParams {
                related_model: self.required("related_model")?,
            }),
            "min" => Calculation::Min(MinParams {
                field_to_min: self.optional("field_to_min"),
            }),
            "max" => Calculation::Max(MaxParams {
                field_to_max: self.optional("field_to_max"),
            }),
            "custom" => Calculation::Custom(CustomParams {
                formula: self.required("formula")?,
            }),
            "mapping" => {
                let raw = self.required("mapping_type")?;
                let mapping_type = MappingKind::parse(&raw).ok_or_else(|| {
                    ValidationError::InvalidCalculationParam {
                        field: self.field.to_string(),
                        calculation_type: "mapping".to_string(),
                        param: "mapping_type".to_string(),
                        reason: format!("unknown mapping type '{}'", raw),
                    }
                })?;
                Calculation::Mapping(MappingParams {
                    mapping_type,
                    mapping_value: self.optional("mapping_value"),
                    source_model: self.optional("source_model"),
                    source_field: self.optional("source_field"),
                    relation_field: self.optional("relation_field"),
                })
            }
            other => Calculation::Dynamic {
                calculation_type: other.to_string(),
                params: self.checked.clone(),
            },
        };
        Ok(calculation)
    }
}

// ============================================================================
// BUILT-IN CATALOG
// ============================================================================

fn param(name: &str, display_name: &str, param_type: ParamType, required: bool) -> CalculationParam {
    CalculationParam {
        name: name.to_string(),
        display_name: display_name.to_string(),
        param_type,
        required,
        options: None,
        default: None,
        description: None,
    }
}

fn select(name: &str, display_name: &str, options: &[&str], default: &str) -> CalculationParam {
    CalculationParam {
        options: Some(options.iter().map(|o| o.to_string()).collect()),
        default: Some(Value::String(default.to_string())),
        ..param(name, display_name, ParamType::Select, true)
    }
}

fn string_with_default(name: &str, display_name: &str, default: &str) -> CalculationParam {
    CalculationParam {
        default: Some(Value::String(default.to_string())),
        ..param(name, display_name, ParamType::String, true)
    }
}

fn described(mut p: CalculationParam, description: &str) -> CalculationParam {
    p.description = Some(description.to_string());
    p
}

fn definition(
    calculation_type: &str,
    display_name: &str,
    description: &str,
    level: Option<AggregationLevel>,
    params: Vec<CalculationParam>,
) -> CalculationDefinition {
    CalculationDefinition {
        calculation_type: calculation_type.to_string(),
        display_name: display_name.to_string(),
        description: description.to_string(),
        level,
        params,
    }
}

/// Calculation kinds the reference backend ships with.
pub static BUILTIN_DEFINITIONS: Lazy<Vec<CalculationDefinition>> = Lazy::new(|| {
    vec![
        definition(
            "sum",
            "Sum",
            "Calculates the sum of related values",
            Some(AggregationLevel::Deal),
            vec![
                select("related_model", "Related Model", &["tranche", "cashflow"], "tranche"),
                string_with_default("field_to_sum", "Field to Sum", "amount"),
            ],
        ),
        definition(
            "average",
            "Average",
            "Calculates the average of related values",
            Some(AggregationLevel::Deal),
            vec![
                select("related_model", "Related Model", &["tranche", "cashflow"], "tranche"),
                string_with_default("field_to_average", "Field to Average", "amount"),
            ],
        ),
        definition(
            "count",
            "Count",
            "Counts the number of related records",
            Some(AggregationLevel::Group),
            vec![select(
                "related_model",
                "Related Model",
                &["deal", "tranche", "cashflow"],
                "deal",
            )],
        ),
        definition(
            "min",
            "Minimum",
            "Calculates the minimum value of related fields",
            Some(AggregationLevel::Tranche),
            vec![string_with_default("field_to_min", "Field to Find Minimum", "amount")],
        ),
        definition(
            "max",
            "Maximum",
            "Calculates the maximum value of related fields",
            Some(AggregationLevel::Tranche),
            vec![string_with_default("field_to_max", "Field to Find Maximum", "amount")],
        ),
        definition(
            "custom",
            "Custom Formula",
            "Executes a custom SQL formula for advanced calculations",
            None,
            vec![described(
                param("formula", "SQL Formula", ParamType::Text, true),
                "SQL formula to calculate the value. Can reference field names directly.",
            )],
        ),
        definition(
            "mapping",
            "Static Mapping",
            "Maps values from any model/field or uses a static value",
            None,
            vec![
                described(
                    select("mapping_type", "Mapping Type", &["static", "model_field"], "static"),
                    "Choose static for a fixed value or model_field to map from another table",
                ),
                param("mapping_value", "Static Value", ParamType::String, false),
                param("source_model", "Source Model", ParamType::String, false),
                param("source_field", "Source Field", ParamType::String, false),
                param("relation_field", "Relation Field", ParamType::String, false),
            ],
        ),
    ]
});
