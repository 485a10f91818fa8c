//! UDF aggregate, its wire payloads and the editable draft.

use crate::calculation::CalculationCatalog;
use crate::field::{validate_field, validate_fields, FieldDefinition};
use crate::{AggregationLevel, UdfId, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// PERSISTED ENTITIES
// ============================================================================

/// A persisted User-Defined Field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Udf {
    pub id: UdfId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub base_model: String,
    pub aggregation_level: AggregationLevel,
    /// Order is the preview and export column order.
    pub fields: Vec<FieldDefinition>,
}

impl Udf {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Payload that would recreate this UDF as-is.
    pub fn to_payload(&self) -> UdfCreate {
        UdfCreate {
            name: self.name.clone(),
            description: self.description.clone(),
            base_model: self.base_model.clone(),
            aggregation_level: self.aggregation_level,
            fields: self.fields.clone(),
        }
    }

    /// Reject a replacement document that changes a creation-time property.
    pub fn check_update(&self, payload: &UdfCreate) -> Result<(), ValidationError> {
        if payload.base_model != self.base_model {
            return Err(ValidationError::ImmutableField {
                field: "base_model".to_string(),
            });
        }
        if payload.aggregation_level != self.aggregation_level {
            return Err(ValidationError::ImmutableField {
                field: "aggregation_level".to_string(),
            });
        }
        Ok(())
    }
}

/// Wire payload for both create and full-document replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdfCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub base_model: String,
    pub aggregation_level: AggregationLevel,
    pub fields: Vec<FieldDefinition>,
}

impl UdfCreate {
    /// Materialize the payload under a backend-assigned id.
    pub fn into_udf(self, id: UdfId) -> Udf {
        Udf {
            id,
            name: self.name,
            description: self.description,
            base_model: self.base_model,
            aggregation_level: self.aggregation_level,
            fields: self.fields,
        }
    }
}

/// A base domain model UDFs and reports can be built on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub aggregation_level: Option<AggregationLevel>,
}

/// Column of a base model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelField {
    pub name: String,
    /// Storage type as reported by the backend, e.g. `VARCHAR(255)`.
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub foreign_key: bool,
}

/// What deleting a UDF referenced by a report layout does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Refuse the delete while any report references the UDF.
    #[default]
    RejectIfReferenced,
    /// Delete anyway; dependent reports surface integrity errors.
    AllowDangling,
}

impl fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletePolicy::RejectIfReferenced => f.write_str("reject_if_referenced"),
            DeletePolicy::AllowDangling => f.write_str("allow_dangling"),
        }
    }
}

// ============================================================================
// DRAFT
// ============================================================================

/// Resolution state of the calculation catalog for a draft's level.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogState {
    /// No aggregation level chosen yet.
    Unresolved,
    Resolving(AggregationLevel),
    Ready(CalculationCatalog),
    /// Resolution failed; the draft behaves as if no calculation exists.
    Failed {
        level: AggregationLevel,
        message: String,
    },
}

impl CatalogState {
    pub fn is_resolving(&self) -> bool {
        matches!(self, CatalogState::Resolving(_))
    }

    pub fn level(&self) -> Option<AggregationLevel> {
        match self {
            CatalogState::Unresolved => None,
            CatalogState::Resolving(level) | CatalogState::Failed { level, .. } => Some(*level),
            CatalogState::Ready(catalog) => Some(catalog.level()),
        }
    }
}

/// Inputs that drive a draft's cascading resets.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftEvent {
    BaseModelChanged(String),
    AggregationLevelChanged(AggregationLevel),
    ModelFieldsLoaded {
        base_model: String,
        fields: Vec<ModelField>,
    },
    CatalogResolved(CalculationCatalog),
    CatalogFailed {
        level: AggregationLevel,
        message: String,
    },
}

/// A UDF being created or edited.
///
/// `base_model` and `aggregation_level` are only editable until the draft
/// has been saved once.
#[derive(Debug, Clone, PartialEq)]
pub struct UdfDraft {
    id: Option<UdfId>,
    pub name: String,
    pub description: Option<String>,
    base_model: Option<String>,
    aggregation_level: Option<AggregationLevel>,
    /// Columns of `base_model`, once loaded.
    model_fields: Option<Vec<ModelField>>,
    catalog: CatalogState,
    fields: Vec<FieldDefinition>,
}

impl Default for UdfDraft {
    fn default() -> Self {
        Self::new()
    }
}

impl UdfDraft {
    pub fn new() -> Self {
        Self {
            id: None,
            name: String::new(),
            description: None,
            base_model: None,
            aggregation_level: None,
            model_fields: None,
            catalog: CatalogState::Unresolved,
            fields: Vec::new(),
        }
    }

    /// Open a persisted UDF for editing. The catalog must be re-resolved.
    pub fn from_udf(udf: &Udf) -> Self {
        Self {
            id: Some(udf.id),
            name: udf.name.clone(),
            description: udf.description.clone(),
            base_model: Some(udf.base_model.clone()),
            aggregation_level: Some(udf.aggregation_level),
            model_fields: None,
            catalog: CatalogState::Resolving(udf.aggregation_level),
            fields: udf.fields.clone(),
        }
    }

    pub fn id(&self) -> Option<UdfId> {
        self.id
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn base_model(&self) -> Option<&str> {
        self.base_model.as_deref()
    }

    pub fn aggregation_level(&self) -> Option<AggregationLevel> {
        self.aggregation_level
    }

    pub fn model_fields(&self) -> &[ModelField] {
        self.model_fields.as_deref().unwrap_or_default()
    }

    /// Primary key of the base model, implied on every UDF.
    pub fn primary_key(&self) -> Option<&ModelField> {
        self.model_fields().iter().find(|f| f.primary_key)
    }

    pub fn catalog_state(&self) -> &CatalogState {
        &self.catalog
    }

    /// Catalog to validate against. Anything but `Ready` yields an empty one.
    pub fn effective_catalog(&self) -> Option<CalculationCatalog> {
        match &self.catalog {
            CatalogState::Unresolved => None,
            CatalogState::Ready(catalog) => Some(catalog.clone()),
            CatalogState::Resolving(level) | CatalogState::Failed { level, .. } => {
                Some(CalculationCatalog::empty(*level))
            }
        }
    }

    /// Calculation type selection is disabled while the catalog resolves.
    pub fn can_select_calculation(&self) -> bool {
        matches!(self.catalog, CatalogState::Ready(_))
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    /// Apply one transition.
    ///
    /// Changing the base model clears loaded model fields and every
    /// `source_field` selection. Changing the level clears the catalog and
    /// every calculation selection and marks the catalog as resolving.
    /// Loaded fields or catalogs for a model or level the draft has since
    /// moved away from are dropped.
    pub fn apply(&mut self, event: DraftEvent) -> Result<(), ValidationError> {
        match event {
            DraftEvent::BaseModelChanged(base_model) => {
                self.ensure_unsaved("base_model")?;
                if self.base_model.as_deref() == Some(base_model.as_str()) {
                    return Ok(());
                }
                self.base_model = Some(base_model);
                self.model_fields = None;
                for field in &mut self.fields {
                    field.source_field = None;
                }
            }
            DraftEvent::AggregationLevelChanged(level) => {
                self.ensure_unsaved("aggregation_level")?;
                if self.aggregation_level == Some(level) {
                    return Ok(());
                }
                self.aggregation_level = Some(level);
                self.catalog = CatalogState::Resolving(level);
                for field in &mut self.fields {
                    field.select_calculation(None);
                }
            }
            DraftEvent::ModelFieldsLoaded { base_model, fields } => {
                if self.base_model.as_deref() == Some(base_model.as_str()) {
                    self.model_fields = Some(fields);
                }
            }
            DraftEvent::CatalogResolved(catalog) => {
                if self.aggregation_level == Some(catalog.level()) {
                    self.catalog = CatalogState::Ready(catalog);
                }
            }
            DraftEvent::CatalogFailed { level, message } => {
                if self.aggregation_level == Some(level) {
                    self.catalog = CatalogState::Failed { level, message };
                }
            }
        }
        Ok(())
    }

    fn ensure_unsaved(&self, field: &str) -> Result<(), ValidationError> {
        if self.is_persisted() {
            return Err(ValidationError::ImmutableField {
                field: field.to_string(),
            });
        }
        Ok(())
    }

    fn catalog_or_empty(&self) -> CalculationCatalog {
        self.effective_catalog().unwrap_or_else(|| {
            CalculationCatalog::empty(self.aggregation_level.unwrap_or(AggregationLevel::Deal))
        })
    }

    /// `source_field` must name a column of the base model. Unchecked until
    /// the model's columns are loaded.
    fn check_source_field(&self, field: &FieldDefinition) -> Result<(), ValidationError> {
        let (Some(source_field), Some(columns), Some(base_model)) = (
            field.source_field.as_deref(),
            self.model_fields.as_deref(),
            self.base_model.as_deref(),
        ) else {
            return Ok(());
        };
        if columns.iter().any(|c| c.name == source_field) {
            return Ok(());
        }
        Err(ValidationError::UnknownSourceField {
            field: field.name.clone(),
            source_field: source_field.to_string(),
            base_model: base_model.to_string(),
        })
    }

    /// Validate and append a field.
    pub fn add_field(&mut self, field: FieldDefinition) -> Result<(), ValidationError> {
        let field = validate_field(&field, &self.fields, &self.catalog_or_empty())?;
        self.check_source_field(&field)?;
        self.fields.push(field);
        Ok(())
    }

    /// Validate and replace the field at `index`.
    pub fn replace_field(
        &mut self,
        index: usize,
        field: FieldDefinition,
    ) -> Result<(), ValidationError> {
        if index >= self.fields.len() {
            return Err(ValidationError::RequiredFieldMissing {
                field: format!("fields[{}]", index),
            });
        }
        let siblings: Vec<FieldDefinition> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, f)| f.clone())
            .collect();
        let field = validate_field(&field, &siblings, &self.catalog_or_empty())?;
        self.check_source_field(&field)?;
        self.fields[index] = field;
        Ok(())
    }

    pub fn remove_field(&mut self, index: usize) -> Option<FieldDefinition> {
        (index < self.fields.len()).then(|| self.fields.remove(index))
    }

    /// Gate a save: every check runs locally before any request is made.
    pub fn validate_for_save(&self) -> Result<UdfCreate, ValidationError> {
        let missing = |field: &str| ValidationError::RequiredFieldMissing {
            field: field.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(missing("name"));
        }
        let base_model = self.base_model.clone().ok_or_else(|| missing("base_model"))?;
        let aggregation_level = self
            .aggregation_level
            .ok_or_else(|| missing("aggregation_level"))?;
        if self.fields.is_empty() {
            return Err(missing("fields"));
        }
        let fields = validate_fields(&self.fields, &self.catalog_or_empty())?;
        for field in &fields {
            self.check_source_field(field)?;
        }
        Ok(UdfCreate {
            name: self.name.trim().to_string(),
            description: self.description.clone(),
            base_model,
            aggregation_level,
            fields,
        })
    }

    /// Record the id assigned by the first successful save.
    pub fn mark_saved(&mut self, udf: &Udf) {
        self.id = Some(udf.id);
        self.name = udf.name.clone();
        self.description = udf.description.clone();
        self.fields = udf.fields.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldType;
    use serde_json::json;

    fn tranche_draft() -> UdfDraft {
        let mut draft = UdfDraft::new();
        draft.name = "Tranche Stats".to_string();
        draft
            .apply(DraftEvent::BaseModelChanged("tranche".to_string()))
            .unwrap();
        draft
            .apply(DraftEvent::AggregationLevelChanged(AggregationLevel::Tranche))
            .unwrap();
        draft
            .apply(DraftEvent::CatalogResolved(CalculationCatalog::builtin(
                AggregationLevel::Tranche,
            )))
            .unwrap();
        draft
    }

    fn udf() -> Udf {
        Udf {
            id: UdfId(1),
            name: "Deal Totals".to_string(),
            description: None,
            base_model: "deal".to_string(),
            aggregation_level: AggregationLevel::Deal,
            fields: vec![FieldDefinition::new("total", FieldType::Number)],
        }
    }

    #[test]
    fn test_save_requires_name_model_level_fields() {
        let mut draft = UdfDraft::new();
        let err = draft.validate_for_save().unwrap_err();
        assert_eq!(
            err,
            ValidationError::RequiredFieldMissing {
                field: "name".to_string()
            }
        );

        draft.name = "x".to_string();
        assert!(matches!(
            draft.validate_for_save().unwrap_err(),
            ValidationError::RequiredFieldMissing { ref field } if field == "base_model"
        ));

        draft
            .apply(DraftEvent::BaseModelChanged("deal".to_string()))
            .unwrap();
        assert!(matches!(
            draft.validate_for_save().unwrap_err(),
            ValidationError::RequiredFieldMissing { ref field } if field == "aggregation_level"
        ));

        draft
            .apply(DraftEvent::AggregationLevelChanged(AggregationLevel::Deal))
            .unwrap();
        assert!(matches!(
            draft.validate_for_save().unwrap_err(),
            ValidationError::RequiredFieldMissing { ref field } if field == "fields"
        ));
    }

    #[test]
    fn test_level_change_clears_calculations_and_resolves() {
        let mut draft = tranche_draft();
        let catalog = CalculationCatalog::builtin(AggregationLevel::Tranche);
        let mut field = FieldDefinition::new("lowest", FieldType::Number);
        field.select_calculation(catalog.get("min"));
        draft.add_field(field).unwrap();

        draft
            .apply(DraftEvent::AggregationLevelChanged(AggregationLevel::Deal))
            .unwrap();

        assert!(draft.catalog_state().is_resolving());
        assert!(!draft.can_select_calculation());
        assert_eq!(draft.fields()[0].calculation_type, None);
        assert!(draft.fields()[0].calculation_params.is_empty());
    }

    fn column(name: &str, primary_key: bool) -> ModelField {
        ModelField {
            name: name.to_string(),
            column_type: if primary_key { "INTEGER" } else { "FLOAT" }.to_string(),
            primary_key,
            nullable: !primary_key,
            foreign_key: false,
        }
    }

    fn load_tranche_columns(draft: &mut UdfDraft) {
        draft
            .apply(DraftEvent::ModelFieldsLoaded {
                base_model: "tranche".to_string(),
                fields: vec![column("id", true), column("amount", false)],
            })
            .unwrap();
    }

    #[test]
    fn test_base_model_change_clears_source_fields_and_model_fields() {
        let mut draft = tranche_draft();
        load_tranche_columns(&mut draft);
        draft
            .add_field(FieldDefinition::new("amt", FieldType::Number).with_source_field("amount"))
            .unwrap();
        assert_eq!(draft.primary_key().map(|f| f.name.as_str()), Some("id"));

        draft
            .apply(DraftEvent::BaseModelChanged("deal".to_string()))
            .unwrap();
        assert!(draft.model_fields().is_empty());
        assert_eq!(draft.fields()[0].source_field, None);
    }

    #[test]
    fn test_source_field_must_be_model_column() {
        let mut draft = tranche_draft();
        load_tranche_columns(&mut draft);

        let err = draft
            .add_field(FieldDefinition::new("amt", FieldType::Number).with_source_field("no_such_column"))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownSourceField {
                field: "amt".to_string(),
                source_field: "no_such_column".to_string(),
                base_model: "tranche".to_string(),
            }
        );
        assert!(draft.fields().is_empty());

        draft
            .add_field(FieldDefinition::new("amt", FieldType::Number).with_source_field("amount"))
            .unwrap();
        assert!(matches!(
            draft.replace_field(
                0,
                FieldDefinition::new("amt", FieldType::Number).with_source_field("rate")
            ),
            Err(ValidationError::UnknownSourceField { .. })
        ));
        assert_eq!(draft.fields()[0].source_field.as_deref(), Some("amount"));
        assert!(draft.validate_for_save().is_ok());
    }

    #[test]
    fn test_source_field_checked_on_save_once_columns_load() {
        let mut draft = tranche_draft();
        // unchecked before the model's columns are known
        draft
            .add_field(FieldDefinition::new("amt", FieldType::Number).with_source_field("missing"))
            .unwrap();
        assert!(draft.validate_for_save().is_ok());

        load_tranche_columns(&mut draft);
        assert!(matches!(
            draft.validate_for_save(),
            Err(ValidationError::UnknownSourceField { ref source_field, .. }) if source_field == "missing"
        ));
    }

    #[test]
    fn test_stale_catalog_is_dropped() {
        let mut draft = tranche_draft();
        draft
            .apply(DraftEvent::AggregationLevelChanged(AggregationLevel::Group))
            .unwrap();
        draft
            .apply(DraftEvent::CatalogResolved(CalculationCatalog::builtin(
                AggregationLevel::Tranche,
            )))
            .unwrap();
        assert!(draft.catalog_state().is_resolving());
    }

    #[test]
    fn test_failed_catalog_degrades_to_empty() {
        let mut draft = UdfDraft::new();
        draft
            .apply(DraftEvent::AggregationLevelChanged(AggregationLevel::Group))
            .unwrap();
        draft
            .apply(DraftEvent::CatalogFailed {
                level: AggregationLevel::Group,
                message: "timeout".to_string(),
            })
            .unwrap();
        let catalog = draft.effective_catalog().unwrap();
        assert!(catalog.is_empty());
        // plain fields can still be edited
        draft
            .add_field(FieldDefinition::new("name", FieldType::String))
            .unwrap();
    }

    #[test]
    fn test_persisted_draft_rejects_immutable_changes() {
        let mut draft = UdfDraft::from_udf(&udf());
        let err = draft
            .apply(DraftEvent::AggregationLevelChanged(AggregationLevel::Tranche))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::ImmutableField {
                field: "aggregation_level".to_string()
            }
        );
        assert!(draft
            .apply(DraftEvent::BaseModelChanged("tranche".to_string()))
            .is_err());
    }

    #[test]
    fn test_persisted_draft_accepts_lookup_results() {
        let mut draft = UdfDraft::from_udf(&udf());
        draft
            .apply(DraftEvent::ModelFieldsLoaded {
                base_model: "deal".to_string(),
                fields: vec![column("id", true)],
            })
            .unwrap();
        draft
            .apply(DraftEvent::CatalogFailed {
                level: AggregationLevel::Deal,
                message: "timeout".to_string(),
            })
            .unwrap();
        draft
            .apply(DraftEvent::CatalogResolved(CalculationCatalog::builtin(
                AggregationLevel::Deal,
            )))
            .unwrap();
        assert!(draft.can_select_calculation());
        assert_eq!(draft.model_fields().len(), 1);
    }

    #[test]
    fn test_check_update_rejects_level_change() {
        let udf = udf();
        let mut payload = udf.to_payload();
        payload.name = "Renamed".to_string();
        assert!(udf.check_update(&payload).is_ok());

        payload.aggregation_level = AggregationLevel::Group;
        assert!(matches!(
            udf.check_update(&payload),
            Err(ValidationError::ImmutableField { .. })
        ));
    }

    #[test]
    fn test_replace_field_ignores_itself_as_sibling() {
        let mut draft = tranche_draft();
        draft
            .add_field(FieldDefinition::new("a", FieldType::String))
            .unwrap();
        draft
            .replace_field(0, FieldDefinition::new("a", FieldType::String).required())
            .unwrap();
        assert!(draft.fields()[0].required);
    }

    #[test]
    fn test_udf_wire_shape() {
        let udf: Udf = serde_json::from_value(json!({
            "id": 4,
            "name": "Deal Totals",
            "description": null,
            "base_model": "deal",
            "aggregation_level": "deal",
            "fields": [{"name": "total", "type": "number", "calculation_params": null}],
            "udf_json": {}
        }))
        .unwrap();
        assert_eq!(udf.id, UdfId(4));
        assert!(udf.has_field("total"));
    }
}
