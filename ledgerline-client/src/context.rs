//! Wiring of the client services around one backend.

use crate::api_client::RestClient;
use crate::builder::ReportBuilder;
use crate::config::ClientConfig;
use crate::editor::UdfEditor;
use crate::error::ClientResult;
use crate::registry::{CalculationSource, RemoteRegistry};
use crate::repository::{ModelCatalog, ReportRepository, UdfRepository};
use crate::runner::ReportRunner;
use ledgerline_core::{Backend, CsvQuoting, DeletePolicy, EntityKind, ReportId, RequestError, UdfId};
use std::path::PathBuf;
use std::sync::Arc;

/// Behaviour switches taken from [`ClientConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    pub delete_policy: DeletePolicy,
    pub csv_quoting: CsvQuoting,
    pub export_dir: PathBuf,
}

impl From<&ClientConfig> for ServiceOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            delete_policy: config.udf_delete_policy,
            csv_quoting: config.csv_quoting,
            export_dir: config.export_dir.clone(),
        }
    }
}

/// All services of one client session.
pub struct Ledgerline {
    udfs: Arc<UdfRepository>,
    reports: Arc<ReportRepository>,
    models: Arc<ModelCatalog>,
    registry: Arc<dyn CalculationSource>,
    runner: ReportRunner,
}

impl Ledgerline {
    /// Session against the REST backend described by `config`.
    pub fn connect(config: &ClientConfig) -> ClientResult<Self> {
        let backend: Arc<dyn Backend> = Arc::new(RestClient::new(config)?);
        let registry = Arc::new(RemoteRegistry::new(Arc::clone(&backend)));
        tracing::info!(api_base_url = %config.api_base_url, "Ledgerline client configured");
        Ok(Self::with_backend(backend, registry, ServiceOptions::from(config)))
    }

    pub fn with_backend(
        backend: Arc<dyn Backend>,
        registry: Arc<dyn CalculationSource>,
        options: ServiceOptions,
    ) -> Self {
        let udfs = Arc::new(UdfRepository::new(Arc::clone(&backend), options.delete_policy));
        let reports = Arc::new(ReportRepository::new(Arc::clone(&backend)));
        let models = Arc::new(ModelCatalog::new(Arc::clone(&backend)));
        let runner = ReportRunner::new(
            backend,
            Arc::clone(&udfs),
            options.csv_quoting,
            options.export_dir,
        );
        Self {
            udfs,
            reports,
            models,
            registry,
            runner,
        }
    }

    pub fn udfs(&self) -> &UdfRepository {
        &self.udfs
    }

    pub fn reports(&self) -> &ReportRepository {
        &self.reports
    }

    pub fn models(&self) -> &ModelCatalog {
        &self.models
    }

    pub fn runner(&self) -> &ReportRunner {
        &self.runner
    }

    /// Load every shared collection.
    pub async fn refresh_all(&self) -> ClientResult<()> {
        self.models.refresh().await?;
        self.udfs.refresh().await?;
        self.reports.refresh().await?;
        Ok(())
    }

    pub fn new_udf(&self) -> UdfEditor {
        UdfEditor::new(
            Arc::clone(&self.udfs),
            Arc::clone(&self.models),
            Arc::clone(&self.registry),
        )
    }

    /// Edit a UDF from the loaded list.
    pub async fn edit_udf(&self, id: UdfId) -> ClientResult<UdfEditor> {
        let udf = self
            .udfs
            .get(id)
            .ok_or_else(|| RequestError::not_found(EntityKind::Udf, id))?;
        Ok(UdfEditor::open(
            &udf,
            Arc::clone(&self.udfs),
            Arc::clone(&self.models),
            Arc::clone(&self.registry),
        )
        .await)
    }

    pub fn new_report(&self) -> ReportBuilder {
        ReportBuilder::new(Arc::clone(&self.udfs), Arc::clone(&self.reports))
    }

    pub fn edit_report(&self, id: ReportId) -> ClientResult<ReportBuilder> {
        let layout = self
            .reports
            .get(id)
            .ok_or_else(|| RequestError::not_found(EntityKind::Report, id))?;
        Ok(ReportBuilder::open(
            &layout,
            Arc::clone(&self.udfs),
            Arc::clone(&self.reports),
        ))
    }
}
