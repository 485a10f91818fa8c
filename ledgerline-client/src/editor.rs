//! UDF editor session.
//!
//! Wraps a [`UdfDraft`] with the remote lookups its transitions need: model
//! columns when the base model changes, the calculation catalog when the
//! level changes. Saving goes through the [`UdfRepository`].

use crate::error::ClientResult;
use crate::registry::{resolve_event, CalculationSource};
use crate::repository::{ModelCatalog, UdfRepository};
use ledgerline_core::{
    compile, AggregationLevel, DraftEvent, EntityKind, FieldDefinition, PresentationSchema, Udf,
    UdfDraft, ValidationError,
};
use std::sync::Arc;

pub struct UdfEditor {
    draft: UdfDraft,
    udfs: Arc<UdfRepository>,
    models: Arc<ModelCatalog>,
    registry: Arc<dyn CalculationSource>,
}

impl UdfEditor {
    /// Start a new, unsaved UDF.
    pub fn new(
        udfs: Arc<UdfRepository>,
        models: Arc<ModelCatalog>,
        registry: Arc<dyn CalculationSource>,
    ) -> Self {
        Self {
            draft: UdfDraft::new(),
            udfs,
            models,
            registry,
        }
    }

    /// Open a persisted UDF, loading its model columns and catalog.
    ///
    /// Lookup failures leave the draft usable: missing columns only disable
    /// source field suggestions and a failed catalog resolves to empty.
    pub async fn open(
        udf: &Udf,
        udfs: Arc<UdfRepository>,
        models: Arc<ModelCatalog>,
        registry: Arc<dyn CalculationSource>,
    ) -> Self {
        let mut editor = Self {
            draft: UdfDraft::from_udf(udf),
            udfs,
            models,
            registry,
        };
        if let Err(e) = editor.load_model_fields(&udf.base_model).await {
            tracing::warn!(udf_id = %udf.id, error = %e, "Model fields unavailable");
        }
        editor.resolve_catalog(udf.aggregation_level).await;
        editor
    }

    pub fn draft(&self) -> &UdfDraft {
        &self.draft
    }

    /// Direct access for name, description and field edits.
    pub fn draft_mut(&mut self) -> &mut UdfDraft {
        &mut self.draft
    }

    pub async fn set_base_model(&mut self, base_model: &str) -> ClientResult<()> {
        self.draft
            .apply(DraftEvent::BaseModelChanged(base_model.to_string()))?;
        self.load_model_fields(base_model).await
    }

    pub async fn set_aggregation_level(&mut self, level: AggregationLevel) -> ClientResult<()> {
        self.draft.apply(DraftEvent::AggregationLevelChanged(level))?;
        self.resolve_catalog(level).await;
        Ok(())
    }

    pub fn add_field(&mut self, field: FieldDefinition) -> ClientResult<()> {
        Ok(self.draft.add_field(field)?)
    }

    /// Live preview of the schema the current fields compile to.
    pub fn preview_schema(&self) -> PresentationSchema {
        compile(self.draft.fields())
    }

    /// Validate locally, then create or replace on the backend.
    pub async fn save(&mut self) -> ClientResult<Udf> {
        let payload = self.draft.validate_for_save()?;
        let udf = match self.draft.id() {
            Some(id) => self.udfs.update(id, &payload).await?,
            None => self.udfs.create(&payload).await?,
        };
        self.draft.mark_saved(&udf);
        Ok(udf)
    }

    /// Generated model source for the saved UDF, verbatim.
    pub async fn generate_code(&self) -> ClientResult<String> {
        let id = self.draft.id().ok_or(ValidationError::NotPersisted {
            entity: EntityKind::Udf,
        })?;
        self.udfs.generate_code(id).await
    }

    async fn load_model_fields(&mut self, base_model: &str) -> ClientResult<()> {
        let fields = self.models.fields(base_model).await?;
        self.draft.apply(DraftEvent::ModelFieldsLoaded {
            base_model: base_model.to_string(),
            fields,
        })?;
        Ok(())
    }

    async fn resolve_catalog(&mut self, level: AggregationLevel) {
        let event = resolve_event(self.registry.as_ref(), level).await;
        if let Err(e) = self.draft.apply(event) {
            tracing::warn!(level = %level, error = %e, "Catalog update rejected by draft");
        }
    }
}
