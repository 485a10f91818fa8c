//! Report builder session.

use crate::error::ClientResult;
use crate::repository::{ReportRepository, UdfRepository};
use ledgerline_core::{
    compatible_udfs, AggregationLevel, CompatibleUdfs, QualifiedField, ReportDraft,
    ReportDraftEvent, ReportLayout, UdfId, ValidationError,
};
use std::sync::Arc;

/// Composes a report layout from the UDFs currently loaded in the
/// [`UdfRepository`].
pub struct ReportBuilder {
    draft: ReportDraft,
    udfs: Arc<UdfRepository>,
    reports: Arc<ReportRepository>,
}

impl ReportBuilder {
    pub fn new(udfs: Arc<UdfRepository>, reports: Arc<ReportRepository>) -> Self {
        Self {
            draft: ReportDraft::new(),
            udfs,
            reports,
        }
    }

    pub fn open(layout: &ReportLayout, udfs: Arc<UdfRepository>, reports: Arc<ReportRepository>) -> Self {
        Self {
            draft: ReportDraft::from_layout(layout),
            udfs,
            reports,
        }
    }

    pub fn draft(&self) -> &ReportDraft {
        &self.draft
    }

    pub fn draft_mut(&mut self) -> &mut ReportDraft {
        &mut self.draft
    }

    pub fn set_primary_model(&mut self, model: &str) -> ClientResult<()> {
        self.draft
            .apply(ReportDraftEvent::PrimaryModelChanged(model.to_string()))?;
        Ok(())
    }

    pub fn set_aggregation_level(&mut self, level: AggregationLevel) -> ClientResult<()> {
        self.draft
            .apply(ReportDraftEvent::AggregationLevelChanged(level))?;
        Ok(())
    }

    /// UDFs that may be added at the draft's level. `None` until a level is
    /// chosen.
    pub fn compatible_udfs(&self) -> Option<CompatibleUdfs> {
        let level = self.draft.aggregation_level()?;
        Some(compatible_udfs(&self.udfs.udfs(), level))
    }

    pub fn toggle_udf(&mut self, udf_id: UdfId) -> ClientResult<bool> {
        let udf = self
            .udfs
            .get(udf_id)
            .ok_or(ValidationError::UnknownUdf { udf_id })?;
        Ok(self.draft.toggle_udf(&udf)?)
    }

    pub fn toggle_field(&mut self, field: &str) -> bool {
        self.draft.toggle_field(field)
    }

    pub fn available_fields(&self) -> Vec<QualifiedField> {
        self.draft.available_fields(&self.udfs.udfs())
    }

    /// Validate against the loaded UDFs, then create or replace.
    pub async fn save(&mut self) -> ClientResult<ReportLayout> {
        let payload = self.draft.validate_for_save(&self.udfs.udfs())?;
        let layout = match self.draft.id() {
            Some(id) => self.reports.update(id, &payload).await?,
            None => self.reports.create(&payload).await?,
        };
        self.draft.mark_saved(&layout);
        Ok(layout)
    }
}
