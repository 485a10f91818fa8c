//! Error types for Ledgerline operations

use crate::{AggregationLevel, FieldType, ReportId, UdfId};
use std::fmt;
use thiserror::Error;

/// Entity kind discriminator used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Udf,
    Report,
    Model,
    Calculation,
    Cycle,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Udf => "UDF",
            EntityKind::Report => "report layout",
            EntityKind::Model => "model",
            EntityKind::Calculation => "calculation",
            EntityKind::Cycle => "cycle",
        };
        f.write_str(name)
    }
}

/// Local, pre-submit validation failures. These block a save and never
/// reach the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Duplicate field name: {name}")]
    DuplicateFieldName { name: String },

    #[error("Unknown calculation type '{calculation_type}' on field {field} for {level} level")]
    UnknownCalculationType {
        field: String,
        calculation_type: String,
        level: AggregationLevel,
    },

    #[error("Missing required parameter '{param}' for {calculation_type} calculation on field {field}")]
    MissingCalculationParam {
        field: String,
        calculation_type: String,
        param: String,
    },

    #[error("Parameter '{param}' is not declared by the {calculation_type} calculation on field {field}")]
    UnknownCalculationParam {
        field: String,
        calculation_type: String,
        param: String,
    },

    #[error("Invalid value for parameter '{param}' of {calculation_type} calculation on field {field}: {reason}")]
    InvalidCalculationParam {
        field: String,
        calculation_type: String,
        param: String,
        reason: String,
    },

    #[error("Invalid enum value on field {field}: {reason}")]
    InvalidEnumValue { field: String, reason: String },

    #[error("Source field '{source_field}' of field {field} not found in model '{base_model}'")]
    UnknownSourceField {
        field: String,
        source_field: String,
        base_model: String,
    },

    #[error("Default value of field {field} is not a valid {expected}")]
    InvalidDefault { field: String, expected: FieldType },

    #[error("{field} cannot be changed after creation")]
    ImmutableField { field: String },

    #[error("UDF '{udf}' has aggregation level '{udf_level}' which is incompatible with report aggregation level '{report_level}'")]
    IncompatibleUdf {
        udf: String,
        udf_level: AggregationLevel,
        report_level: AggregationLevel,
    },

    #[error("UDF {udf_id} is not in the loaded UDF list")]
    UnknownUdf { udf_id: UdfId },

    #[error("Field reference '{reference}' does not resolve to a selected UDF field")]
    UnresolvedFieldReference { reference: String },

    #[error("Invalid qualified field name '{value}': expected <udf_name>.<field_name>")]
    InvalidQualifiedField { value: String },

    #[error("{entity} must be saved before this operation")]
    NotPersisted { entity: EntityKind },
}

/// Backend or transport failures. Prior client state is left intact.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("{operation} failed: {message}")]
    Failed { operation: String, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("{operation} rejected by backend: {message}")]
    Rejected { operation: String, message: String },
}

impl RequestError {
    pub fn failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        RequestError::Failed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: EntityKind, id: impl fmt::Display) -> Self {
        RequestError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Drift between a report layout and the UDFs it references.
/// Flagged, never auto-repaired.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Report '{report}' references UDF {udf_id} which no longer exists")]
    MissingUdf { report: String, udf_id: UdfId },

    #[error("Report '{report}' field '{reference}' no longer resolves")]
    UnresolvedField { report: String, reference: String },

    #[error("Report '{report}' references UDF '{udf}' at level '{udf_level}' but the report is '{report_level}'")]
    LevelMismatch {
        report: String,
        udf: String,
        udf_level: AggregationLevel,
        report_level: AggregationLevel,
    },

    #[error("UDF {udf_id} is referenced by report {report_id}")]
    UdfInUse { udf_id: UdfId, report_id: ReportId },
}

/// Export rejections. None of these perform a file write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExportError {
    #[error("No data to export")]
    NoRows,

    #[error("No fields selected for export")]
    NoFields,

    #[error("CSV encoding failed: {0}")]
    Encoding(String),

    #[error("Failed to write export file: {0}")]
    Io(String),
}

/// Report run state machine violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("Report {report_id} already has a run in flight")]
    AlreadyRunning { report_id: ReportId },

    #[error("Report {report_id} has no successful run to export")]
    NoSuccessfulRun { report_id: ReportId },
}

/// Master error type for all Ledgerline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),
}

/// Result type alias for Ledgerline operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_missing_param() {
        let err = ValidationError::MissingCalculationParam {
            field: "total".to_string(),
            calculation_type: "sum".to_string(),
            param: "related_model".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("related_model"));
        assert!(msg.contains("sum"));
        assert!(msg.contains("total"));
    }

    #[test]
    fn test_validation_error_display_incompatible_udf() {
        let err = ValidationError::IncompatibleUdf {
            udf: "LoanSummary".to_string(),
            udf_level: AggregationLevel::Tranche,
            report_level: AggregationLevel::Deal,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("'tranche'"));
        assert!(msg.contains("'deal'"));
    }

    #[test]
    fn test_integrity_error_display_missing_udf() {
        let err = IntegrityError::MissingUdf {
            report: "Monthly".to_string(),
            udf_id: UdfId(7),
        };
        assert_eq!(
            err.to_string(),
            "Report 'Monthly' references UDF 7 which no longer exists"
        );
    }

    #[test]
    fn test_request_error_not_found() {
        let err = RequestError::not_found(EntityKind::Udf, UdfId(3));
        assert_eq!(err.to_string(), "UDF not found: 3");
    }

    #[test]
    fn test_ledger_error_from_variants() {
        let validation = LedgerError::from(ValidationError::RequiredFieldMissing {
            field: "name".to_string(),
        });
        assert!(matches!(validation, LedgerError::Validation(_)));

        let request = LedgerError::from(RequestError::failed("list UDFs", "timeout"));
        assert!(matches!(request, LedgerError::Request(_)));

        let integrity = LedgerError::from(IntegrityError::UnresolvedField {
            report: "r".to_string(),
            reference: "A.x".to_string(),
        });
        assert!(matches!(integrity, LedgerError::Integrity(_)));

        let export = LedgerError::from(ExportError::NoRows);
        assert!(matches!(export, LedgerError::Export(_)));

        let run = LedgerError::from(RunError::AlreadyRunning {
            report_id: ReportId(1),
        });
        assert!(matches!(run, LedgerError::Run(_)));
    }
}
