//! Field definitions: one stored, source-derived or computed field of a UDF.

use crate::calculation::{Calculation, CalculationCatalog, CalculationDefinition, ParamMap};
use crate::{FieldType, ValidationError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A single field of a UDF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values. Only meaningful for `string` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    /// Lookup key into the base model's fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculation_type: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub calculation_params: ParamMap,
    /// Display format hint, carried verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<ParamMap, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<ParamMap>::deserialize(deserializer)?.unwrap_or_default())
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            description: None,
            default: None,
            enum_values: None,
            source_field: None,
            calculation_type: None,
            calculation_params: ParamMap::new(),
            format: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_source_field(mut self, source_field: impl Into<String>) -> Self {
        self.source_field = Some(source_field.into());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = Some(values.into_iter().map(|v| Value::String(v.into())).collect());
        self
    }

    /// Attach a typed calculation, encoding its parameters to the wire map.
    pub fn with_calculation(mut self, calculation: &Calculation) -> Self {
        self.calculation_type = Some(calculation.calculation_type().to_string());
        self.calculation_params = calculation.to_params();
        self
    }

    /// Attach a calculation kind by name with raw parameters.
    pub fn with_raw_calculation(mut self, calculation_type: impl Into<String>, params: ParamMap) -> Self {
        self.calculation_type = Some(calculation_type.into());
        self.calculation_params = params;
        self
    }

    pub fn is_computed(&self) -> bool {
        self.calculation_type.is_some()
    }

    /// Switch the calculation kind.
    ///
    /// Parameters are reset to exactly the new definition's declared
    /// defaults; anything carried over from the previous kind is dropped.
    /// `None` clears the calculation and its parameters.
    pub fn select_calculation(&mut self, definition: Option<&CalculationDefinition>) {
        match definition {
            Some(definition) => {
                self.calculation_type = Some(definition.calculation_type.clone());
                self.calculation_params = definition.default_params();
            }
            None => {
                self.calculation_type = None;
                self.calculation_params.clear();
            }
        }
    }

    /// Decode this field's calculation against `catalog`.
    pub fn calculation(
        &self,
        catalog: &CalculationCatalog,
    ) -> Result<Option<Calculation>, ValidationError> {
        let Some(calculation_type) = self.calculation_type.as_deref() else {
            return Ok(None);
        };
        let definition =
            catalog
                .get(calculation_type)
                .ok_or_else(|| ValidationError::UnknownCalculationType {
                    field: self.name.clone(),
                    calculation_type: calculation_type.to_string(),
                    level: catalog.level(),
                })?;
        Calculation::decode(definition, &self.name, &self.calculation_params).map(Some)
    }
}

/// Validate one draft field against its siblings and the resolved catalog.
///
/// Rules apply in order and the first failure is returned:
/// 1. name is non-empty and unique among `siblings` (exact match)
/// 2. a set calculation type is known to `catalog`
/// 3. the calculation's parameters decode against its definition
/// 4. enum values are strings on a string field
/// 5. a default value matches the field type
///
/// `siblings` must not contain `draft` itself.
pub fn validate_field(
    draft: &FieldDefinition,
    siblings: &[FieldDefinition],
    catalog: &CalculationCatalog,
) -> Result<FieldDefinition, ValidationError> {
    if draft.name.trim().is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "name".to_string(),
        });
    }
    if siblings.iter().any(|s| s.name == draft.name) {
        return Err(ValidationError::DuplicateFieldName {
            name: draft.name.clone(),
        });
    }

    draft.calculation(catalog)?;

    if let Some(values) = &draft.enum_values {
        if draft.field_type != FieldType::String && !values.is_empty() {
            return Err(ValidationError::InvalidEnumValue {
                field: draft.name.clone(),
                reason: format!("enum values only apply to string fields, not {}", draft.field_type),
            });
        }
        if let Some(bad) = values.iter().find(|v| !v.is_string()) {
            return Err(ValidationError::InvalidEnumValue {
                field: draft.name.clone(),
                reason: format!("{} is not a string", bad),
            });
        }
    }

    if let Some(default) = &draft.default {
        if !default.is_null() && !draft.field_type.accepts(default) {
            return Err(ValidationError::InvalidDefault {
                field: draft.name.clone(),
                expected: draft.field_type,
            });
        }
    }

    Ok(draft.clone())
}

/// Validate every field of a UDF, in order, returning the first failure.
pub fn validate_fields(
    fields: &[FieldDefinition],
    catalog: &CalculationCatalog,
) -> Result<Vec<FieldDefinition>, ValidationError> {
    let mut validated = Vec::with_capacity(fields.len());
    for (index, field) in fields.iter().enumerate() {
        validated.push(validate_field(field, &fields[..index], catalog)?);
    }
    Ok(validated)
}
