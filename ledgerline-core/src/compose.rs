//! Report composition: compatible-UDF filtering, field flattening, the
//! editable report draft and layout integrity checks.

use crate::report::{LayoutJson, QualifiedField, ReportLayout, ReportLayoutCreate};
use crate::udf::Udf;
use crate::{AggregationLevel, IntegrityError, ReportId, UdfId, ValidationError};

// ============================================================================
// COMPATIBILITY AND FLATTENING
// ============================================================================

/// UDFs whose level matches a report's level.
///
/// An empty result is a normal outcome; callers should show a dedicated
/// "no compatible UDFs for this level" state rather than a generic empty list.
#[derive(Debug, Clone, PartialEq)]
pub struct CompatibleUdfs {
    level: AggregationLevel,
    udfs: Vec<Udf>,
}

impl CompatibleUdfs {
    pub fn level(&self) -> AggregationLevel {
        self.level
    }

    pub fn is_empty(&self) -> bool {
        self.udfs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.udfs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Udf> {
        self.udfs.iter()
    }

    pub fn as_slice(&self) -> &[Udf] {
        &self.udfs
    }

    pub fn into_vec(self) -> Vec<Udf> {
        self.udfs
    }
}

/// Exactly the UDFs at `level`, in input order.
pub fn compatible_udfs(all: &[Udf], level: AggregationLevel) -> CompatibleUdfs {
    CompatibleUdfs {
        level,
        udfs: all
            .iter()
            .filter(|u| u.aggregation_level == level)
            .cloned()
            .collect(),
    }
}

/// Every field of every selected UDF as `<udf>.<field>`.
///
/// Same-named fields of different UDFs stay distinct; nothing is deduplicated.
pub fn flatten_fields(selected: &[Udf]) -> Vec<QualifiedField> {
    selected
        .iter()
        .flat_map(|udf| {
            udf.fields
                .iter()
                .map(move |f| QualifiedField::new(udf.name.clone(), f.name.clone()))
        })
        .collect()
}

fn resolves(reference: &str, udfs: &[&Udf]) -> bool {
    QualifiedField::parse(reference)
        .map(|q| udfs.iter().any(|u| u.name == q.udf && u.has_field(&q.field)))
        .unwrap_or(false)
}

// ============================================================================
// FIELD SELECTION
// ============================================================================

/// Ordered set of selected qualified field names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldSelection {
    fields: Vec<String>,
}

impl FieldSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `field` at the end if absent, remove it if present.
    /// Returns whether the field is selected afterwards.
    pub fn toggle(&mut self, field: &str) -> bool {
        match self.fields.iter().position(|f| f == field) {
            Some(index) => {
                self.fields.remove(index);
                false
            }
            None => {
                self.fields.push(field.to_string());
                true
            }
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    /// Drop every reference into the UDF called `udf_name`.
    pub fn remove_udf(&mut self, udf_name: &str) {
        self.fields.retain(|f| {
            QualifiedField::parse(f)
                .map(|q| q.udf != udf_name)
                .unwrap_or(true)
        });
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.fields
    }
}

impl<S: Into<String>> FromIterator<S> for FieldSelection {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut selection = FieldSelection::new();
        for field in iter {
            let field = field.into();
            if !selection.contains(&field) {
                selection.fields.push(field);
            }
        }
        selection
    }
}

// ============================================================================
// REPORT DRAFT
// ============================================================================

/// Inputs that reset a report draft's selections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDraftEvent {
    PrimaryModelChanged(String),
    AggregationLevelChanged(AggregationLevel),
}

/// A report layout being created or edited.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReportDraft {
    id: Option<ReportId>,
    pub name: String,
    pub description: Option<String>,
    primary_model: Option<String>,
    aggregation_level: Option<AggregationLevel>,
    udf_ids: Vec<UdfId>,
    selection: FieldSelection,
    layout_extra: serde_json::Map<String, serde_json::Value>,
}

impl ReportDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_layout(layout: &ReportLayout) -> Self {
        Self {
            id: Some(layout.id),
            name: layout.name.clone(),
            description: layout.description.clone(),
            primary_model: Some(layout.primary_model.clone()),
            aggregation_level: Some(layout.aggregation_level),
            udf_ids: layout.udf_ids.clone(),
            selection: layout.fields().iter().cloned().collect(),
            layout_extra: layout.layout_json.extra.clone(),
        }
    }

    pub fn id(&self) -> Option<ReportId> {
        self.id
    }

    pub fn primary_model(&self) -> Option<&str> {
        self.primary_model.as_deref()
    }

    pub fn aggregation_level(&self) -> Option<AggregationLevel> {
        self.aggregation_level
    }

    pub fn udf_ids(&self) -> &[UdfId] {
        &self.udf_ids
    }

    pub fn selection(&self) -> &FieldSelection {
        &self.selection
    }

    /// Changing the primary model or the level resets UDF and field
    /// selection together. The level is fixed once the report is saved.
    pub fn apply(&mut self, event: ReportDraftEvent) -> Result<(), ValidationError> {
        match event {
            ReportDraftEvent::PrimaryModelChanged(model) => {
                if self.primary_model.as_deref() == Some(model.as_str()) {
                    return Ok(());
                }
                self.primary_model = Some(model);
            }
            ReportDraftEvent::AggregationLevelChanged(level) => {
                if self.aggregation_level == Some(level) {
                    return Ok(());
                }
                if self.id.is_some() {
                    return Err(ValidationError::ImmutableField {
                        field: "aggregation_level".to_string(),
                    });
                }
                self.aggregation_level = Some(level);
            }
        }
        self.udf_ids.clear();
        self.selection.clear();
        Ok(())
    }

    /// Select or deselect a UDF. Deselecting drops its field references.
    /// Returns whether the UDF is selected afterwards.
    pub fn toggle_udf(&mut self, udf: &Udf) -> Result<bool, ValidationError> {
        if let Some(index) = self.udf_ids.iter().position(|id| *id == udf.id) {
            self.udf_ids.remove(index);
            self.selection.remove_udf(&udf.name);
            return Ok(false);
        }
        let report_level = self.aggregation_level.ok_or_else(|| {
            ValidationError::RequiredFieldMissing {
                field: "aggregation_level".to_string(),
            }
        })?;
        if udf.aggregation_level != report_level {
            return Err(ValidationError::IncompatibleUdf {
                udf: udf.name.clone(),
                udf_level: udf.aggregation_level,
                report_level,
            });
        }
        self.udf_ids.push(udf.id);
        Ok(true)
    }

    pub fn toggle_field(&mut self, field: &str) -> bool {
        self.selection.toggle(field)
    }

    /// Fields offered for selection: all fields of the selected UDFs.
    pub fn available_fields(&self, udfs: &[Udf]) -> Vec<QualifiedField> {
        let selected: Vec<Udf> = self
            .udf_ids
            .iter()
            .filter_map(|id| udfs.iter().find(|u| u.id == *id).cloned())
            .collect();
        flatten_fields(&selected)
    }

    /// Gate a save against the loaded UDF list.
    pub fn validate_for_save(&self, udfs: &[Udf]) -> Result<ReportLayoutCreate, ValidationError> {
        let missing = |field: &str| ValidationError::RequiredFieldMissing {
            field: field.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(missing("name"));
        }
        let primary_model = self
            .primary_model
            .clone()
            .ok_or_else(|| missing("primary_model"))?;
        let report_level = self
            .aggregation_level
            .ok_or_else(|| missing("aggregation_level"))?;
        if self.udf_ids.is_empty() {
            return Err(missing("udf_ids"));
        }

        let mut selected = Vec::with_capacity(self.udf_ids.len());
        for udf_id in &self.udf_ids {
            let udf = udfs
                .iter()
                .find(|u| u.id == *udf_id)
                .ok_or(ValidationError::UnknownUdf { udf_id: *udf_id })?;
            if udf.aggregation_level != report_level {
                return Err(ValidationError::IncompatibleUdf {
                    udf: udf.name.clone(),
                    udf_level: udf.aggregation_level,
                    report_level,
                });
            }
            selected.push(udf);
        }

        if let Some(reference) = self
            .selection
            .as_slice()
            .iter()
            .find(|r| !resolves(r, &selected))
        {
            return Err(ValidationError::UnresolvedFieldReference {
                reference: reference.clone(),
            });
        }

        Ok(ReportLayoutCreate {
            name: self.name.trim().to_string(),
            description: self.description.clone(),
            primary_model,
            aggregation_level: report_level,
            udf_ids: self.udf_ids.clone(),
            layout_json: LayoutJson {
                fields: self.selection.as_slice().to_vec(),
                extra: self.layout_extra.clone(),
            },
        })
    }

    pub fn mark_saved(&mut self, layout: &ReportLayout) {
        self.id = Some(layout.id);
    }
}

// ============================================================================
// INTEGRITY
// ============================================================================

/// Every way `layout` has drifted from the current UDF list.
///
/// Nothing is repaired; a non-empty result means the report must not run.
pub fn check_integrity(layout: &ReportLayout, udfs: &[Udf]) -> Vec<IntegrityError> {
    let mut errors = Vec::new();
    let mut referenced = Vec::with_capacity(layout.udf_ids.len());

    for udf_id in &layout.udf_ids {
        match udfs.iter().find(|u| u.id == *udf_id) {
            Some(udf) => {
                if udf.aggregation_level != layout.aggregation_level {
                    errors.push(IntegrityError::LevelMismatch {
                        report: layout.name.clone(),
                        udf: udf.name.clone(),
                        udf_level: udf.aggregation_level,
                        report_level: layout.aggregation_level,
                    });
                }
                referenced.push(udf);
            }
            None => errors.push(IntegrityError::MissingUdf {
                report: layout.name.clone(),
                udf_id: *udf_id,
            }),
        }
    }

    for reference in layout.fields() {
        if !resolves(reference, &referenced) {
            errors.push(IntegrityError::UnresolvedField {
                report: layout.name.clone(),
                reference: reference.clone(),
            });
        }
    }
    errors
}

/// First integrity problem of `layout`, if any.
pub fn ensure_integrity(layout: &ReportLayout, udfs: &[Udf]) -> Result<(), IntegrityError> {
    match check_integrity(layout, udfs).into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
