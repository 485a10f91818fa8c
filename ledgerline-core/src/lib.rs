//! Ledgerline Core - UDF and Report Engine
//!
//! Field definitions validated against registry-provided calculation
//! metadata, UDF drafts, the presentation schema compiler, report
//! composition, CSV export and the report run state machine.
//!
//! Nothing here performs network I/O. Remote operations are expressed by the
//! [`Backend`] trait and implemented by the client crate.

mod backend;
pub mod calculation;
pub mod compose;
mod enums;
mod error;
pub mod export;
pub mod field;
mod identity;
pub mod report;
pub mod run;
pub mod schema;
pub mod udf;

pub use backend::Backend;
pub use calculation::{
    Calculation, CalculationCatalog, CalculationDefinition, CalculationParam, ParamMap,
};
pub use compose::{
    check_integrity, compatible_udfs, ensure_integrity, flatten_fields, CompatibleUdfs,
    FieldSelection, ReportDraft, ReportDraftEvent,
};
pub use enums::{AggregationLevel, EnumParseError, FieldType, ParamType};
pub use error::{
    EntityKind, ExportError, IntegrityError, LedgerError, LedgerResult, RequestError, RunError,
    ValidationError,
};
pub use export::{export_csv, sanitize_file_name, CsvExport, CsvQuoting};
pub use field::{validate_field, validate_fields, FieldDefinition};
pub use identity::{CycleCode, ReportId, RunTicket, Timestamp, UdfId};
pub use report::{
    LayoutJson, QualifiedField, ReportLayout, ReportLayoutCreate, ReportRunRequest,
    ReportRunResponse, Row,
};
pub use run::{ReportRun, RunState};
pub use schema::{compile, PresentationSchema, PropertySchema, SchemaViolation};
pub use udf::{
    CatalogState, DeletePolicy, DraftEvent, ModelField, ModelInfo, Udf, UdfCreate, UdfDraft,
};

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
