//! Backend collaborator trait.
//!
//! Every remote operation the client performs goes through this trait, so
//! the REST transport and the in-memory test backend are interchangeable.

use crate::calculation::CalculationDefinition;
use crate::report::{ReportLayout, ReportLayoutCreate, ReportRunRequest, ReportRunResponse};
use crate::udf::{ModelField, ModelInfo, Udf, UdfCreate};
use crate::{AggregationLevel, CycleCode, LedgerResult, ReportId, UdfId};
use async_trait::async_trait;

/// Async access to the backend of record.
///
/// Implementations report transport and server failures as
/// `LedgerError::Request` and never retry.
#[async_trait]
pub trait Backend: Send + Sync {
    // ========================================================================
    // UDF OPERATIONS
    // ========================================================================

    async fn list_udfs(&self) -> LedgerResult<Vec<Udf>>;

    async fn create_udf(&self, payload: &UdfCreate) -> LedgerResult<Udf>;

    /// Full-document replace.
    async fn update_udf(&self, id: UdfId, payload: &UdfCreate) -> LedgerResult<Udf>;

    /// `RequestError::NotFound` when no UDF has `id`.
    async fn delete_udf(&self, id: UdfId) -> LedgerResult<()>;

    /// Source text generated from a persisted UDF, verbatim.
    async fn generate_udf_code(&self, id: UdfId) -> LedgerResult<String>;

    // ========================================================================
    // MODEL CATALOG
    // ========================================================================

    async fn list_models(&self) -> LedgerResult<Vec<ModelInfo>>;

    async fn model_fields(&self, model_id: &str) -> LedgerResult<Vec<ModelField>>;

    // ========================================================================
    // CALCULATION REGISTRY
    // ========================================================================

    async fn list_calculations(
        &self,
        level: AggregationLevel,
    ) -> LedgerResult<Vec<CalculationDefinition>>;

    // ========================================================================
    // REPORT OPERATIONS
    // ========================================================================

    async fn list_reports(&self) -> LedgerResult<Vec<ReportLayout>>;

    async fn create_report(&self, payload: &ReportLayoutCreate) -> LedgerResult<ReportLayout>;

    async fn update_report(
        &self,
        id: ReportId,
        payload: &ReportLayoutCreate,
    ) -> LedgerResult<ReportLayout>;

    async fn delete_report(&self, id: ReportId) -> LedgerResult<()>;

    async fn run_report(&self, request: &ReportRunRequest) -> LedgerResult<ReportRunResponse>;

    async fn list_cycles(&self) -> LedgerResult<Vec<CycleCode>>;
}
