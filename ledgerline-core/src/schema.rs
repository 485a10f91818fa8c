//! Compiles a UDF's fields into the JSON-Schema-like presentation schema
//! used by live preview and handed to code generation.

use crate::field::FieldDefinition;
use crate::FieldType;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Item schema of an `array` property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSchema {
    #[serde(rename = "type")]
    pub item_type: FieldType,
}

/// Schema of one property. Serialized keys appear in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub property_type: FieldType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<ItemSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

/// Object schema whose property order matches the compiled field order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PresentationSchema {
    properties: Vec<(String, PropertySchema)>,
    required: Vec<String>,
}

impl Serialize for PresentationSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Properties<'a>(&'a [(String, PropertySchema)]);

        impl Serialize for Properties<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for (name, property) in self.0 {
                    map.serialize_entry(name, property)?;
                }
                map.end()
            }
        }

        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("type", "object")?;
        map.serialize_entry("properties", &Properties(&self.properties))?;
        map.serialize_entry("required", &self.required)?;
        map.end()
    }
}

/// Compile fields into a presentation schema. Pure and order-preserving.
pub fn compile(fields: &[FieldDefinition]) -> PresentationSchema {
    let mut schema = PresentationSchema::default();
    for field in fields {
        schema
            .properties
            .push((field.name.clone(), compile_property(field)));
        if field.required {
            schema.required.push(field.name.clone());
        }
    }
    schema
}

fn compile_property(field: &FieldDefinition) -> PropertySchema {
    let items = (field.field_type == FieldType::Array).then_some(ItemSchema {
        item_type: FieldType::String,
    });
    let enum_values = field
        .enum_values
        .as_ref()
        .filter(|values| !values.is_empty())
        .cloned();

    PropertySchema {
        property_type: field.field_type,
        items,
        description: describe(field),
        default: field.default.clone(),
        enum_values,
    }
}

fn describe(field: &FieldDefinition) -> Option<String> {
    let annotation = field.calculation_type.as_ref().map(|kind| match &field.source_field {
        Some(source) => format!("Calculation: {} of {}", kind, source),
        None => format!("Calculation: {}", kind),
    });
    let description = field.description.as_ref().filter(|d| !d.is_empty());

    match (description, annotation) {
        (Some(description), Some(annotation)) => Some(format!("{} ({})", description, annotation)),
        (Some(description), None) => Some(description.clone()),
        (None, annotation) => annotation,
    }
}

impl PresentationSchema {
    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertySchema)> {
        self.properties.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn property(&self, name: &str) -> Option<&PropertySchema> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Tree form for inspection. Object keys come back sorted; use
    /// [`Self::to_json_string`] where property order matters.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Canonical JSON text. Equal input fields give byte-identical output.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// SHA-256 of the canonical JSON, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_json_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check a preview record against the schema.
    ///
    /// `null` counts as absent. Properties not declared by the schema are
    /// ignored.
    pub fn validate_record(&self, record: &Value) -> Vec<SchemaViolation> {
        let Some(object) = record.as_object() else {
            return vec![SchemaViolation::NotAnObject];
        };

        let mut violations = Vec::new();
        for (name, property) in &self.properties {
            let value = object.get(name).filter(|v| !v.is_null());
            let Some(value) = value else {
                if self.required.contains(name) {
                    violations.push(SchemaViolation::MissingRequired {
                        field: name.clone(),
                    });
                }
                continue;
            };
            if !property.property_type.accepts(value) {
                violations.push(SchemaViolation::WrongType {
                    field: name.clone(),
                    expected: property.property_type,
                });
                continue;
            }
            if let Some(allowed) = &property.enum_values {
                if !allowed.contains(value) {
                    violations.push(SchemaViolation::NotInEnum {
                        field: name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        violations
    }
}

/// A preview record that does not satisfy the compiled schema.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaViolation {
    NotAnObject,
    MissingRequired { field: String },
    WrongType { field: String, expected: FieldType },
    NotInEnum { field: String, value: Value },
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaViolation::NotAnObject => f.write_str("record is not an object"),
            SchemaViolation::MissingRequired { field } => write!(f, "{} is required", field),
            SchemaViolation::WrongType { field, expected } => {
                write!(f, "{} must be of type {}", field, expected)
            }
            SchemaViolation::NotInEnum { field, value } => {
                write!(f, "{} is not an allowed value for {}", value, field)
            }
        }
    }
}
