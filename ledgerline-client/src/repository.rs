//! Repositories over the backend's shared collections.
//!
//! Each repository caches one collection, exposes an explicit `refresh()`,
//! and refetches the whole collection after every successful mutation.
//! A second save or delete of the same entity while one is in flight is
//! rejected with [`ClientError::Busy`].

use crate::error::{ClientError, ClientResult};
use ledgerline_core::{
    Backend, DeletePolicy, EntityKind, IntegrityError, ModelField, ModelInfo, ReportId,
    ReportLayout, ReportLayoutCreate, Udf, UdfCreate, UdfId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

// ============================================================================
// IN-FLIGHT TRACKING
// ============================================================================

#[derive(Debug, Clone)]
struct InFlight {
    entity: EntityKind,
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn acquire(&self, key: String) -> ClientResult<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            tracing::debug!(entity = %self.entity, key = %key, "Rejecting concurrent mutation");
            return Err(ClientError::Busy {
                entity: self.entity,
                id: key,
            });
        }
        Ok(InFlightGuard {
            keys: Arc::clone(&self.keys),
            key,
        })
    }
}

/// Releases the in-flight key on drop, including on error paths.
struct InFlightGuard {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(&self.key);
    }
}

fn new_key(name: &str) -> String {
    format!("new:{}", name)
}

fn read_cache<T: Clone>(cache: &RwLock<T>) -> T {
    cache.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn write_cache<T>(cache: &RwLock<T>, value: T) {
    *cache.write().unwrap_or_else(|e| e.into_inner()) = value;
}

// ============================================================================
// UDF REPOSITORY
// ============================================================================

pub struct UdfRepository {
    backend: Arc<dyn Backend>,
    policy: DeletePolicy,
    cache: RwLock<Vec<Udf>>,
    in_flight: InFlight,
}

impl UdfRepository {
    pub fn new(backend: Arc<dyn Backend>, policy: DeletePolicy) -> Self {
        Self {
            backend,
            policy,
            cache: RwLock::new(Vec::new()),
            in_flight: InFlight::new(EntityKind::Udf),
        }
    }

    pub fn policy(&self) -> DeletePolicy {
        self.policy
    }

    /// Snapshot of the last fetched list.
    pub fn udfs(&self) -> Vec<Udf> {
        read_cache(&self.cache)
    }

    pub fn get(&self, id: UdfId) -> Option<Udf> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|u| u.id == id)
            .cloned()
    }

    /// Replace the cache with the backend's list. On failure the previous
    /// list is kept.
    pub async fn refresh(&self) -> ClientResult<Vec<Udf>> {
        let udfs = self.backend.list_udfs().await?;
        tracing::debug!(count = udfs.len(), "UDF list refreshed");
        write_cache(&self.cache, udfs.clone());
        Ok(udfs)
    }

    pub async fn create(&self, payload: &UdfCreate) -> ClientResult<Udf> {
        let _guard = self.in_flight.acquire(new_key(&payload.name))?;
        let udf = self.backend.create_udf(payload).await?;
        tracing::info!(udf_id = %udf.id, name = %udf.name, "UDF created");
        self.refresh_after("create").await;
        Ok(udf)
    }

    /// Full-document replace. `base_model` and `aggregation_level` must
    /// match the stored UDF.
    pub async fn update(&self, id: UdfId, payload: &UdfCreate) -> ClientResult<Udf> {
        let _guard = self.in_flight.acquire(id.to_string())?;
        if let Some(existing) = self.get(id) {
            existing.check_update(payload)?;
        }
        let udf = self.backend.update_udf(id, payload).await?;
        tracing::info!(udf_id = %udf.id, fields = udf.fields.len(), "UDF updated");
        self.refresh_after("update").await;
        Ok(udf)
    }

    /// Delete a UDF, honouring the configured [`DeletePolicy`].
    pub async fn delete(&self, id: UdfId) -> ClientResult<()> {
        let _guard = self.in_flight.acquire(id.to_string())?;
        if self.policy == DeletePolicy::RejectIfReferenced {
            let reports = self.backend.list_reports().await?;
            if let Some(report) = reports.iter().find(|r| r.references_udf(id)) {
                tracing::warn!(udf_id = %id, report_id = %report.id, "Refusing to delete referenced UDF");
                return Err(IntegrityError::UdfInUse {
                    udf_id: id,
                    report_id: report.id,
                }
                .into());
            }
        }
        self.backend.delete_udf(id).await?;
        tracing::info!(udf_id = %id, policy = %self.policy, "UDF deleted");
        self.refresh_after("delete").await;
        Ok(())
    }

    pub async fn generate_code(&self, id: UdfId) -> ClientResult<String> {
        Ok(self.backend.generate_udf_code(id).await?)
    }

    async fn refresh_after(&self, operation: &'static str) {
        if let Err(e) = self.refresh().await {
            tracing::warn!(operation, error = %e, "UDF refetch after mutation failed");
        }
    }
}

// ============================================================================
// REPORT REPOSITORY
// ============================================================================

pub struct ReportRepository {
    backend: Arc<dyn Backend>,
    cache: RwLock<Vec<ReportLayout>>,
    in_flight: InFlight,
}

impl ReportRepository {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            cache: RwLock::new(Vec::new()),
            in_flight: InFlight::new(EntityKind::Report),
        }
    }

    pub fn reports(&self) -> Vec<ReportLayout> {
        read_cache(&self.cache)
    }

    pub fn get(&self, id: ReportId) -> Option<ReportLayout> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub async fn refresh(&self) -> ClientResult<Vec<ReportLayout>> {
        let reports = self.backend.list_reports().await?;
        tracing::debug!(count = reports.len(), "Report list refreshed");
        write_cache(&self.cache, reports.clone());
        Ok(reports)
    }

    pub async fn create(&self, payload: &ReportLayoutCreate) -> ClientResult<ReportLayout> {
        let _guard = self.in_flight.acquire(new_key(&payload.name))?;
        let layout = self.backend.create_report(payload).await?;
        tracing::info!(report_id = %layout.id, name = %layout.name, "Report layout created");
        self.refresh_after("create").await;
        Ok(layout)
    }

    pub async fn update(&self, id: ReportId, payload: &ReportLayoutCreate) -> ClientResult<ReportLayout> {
        let _guard = self.in_flight.acquire(id.to_string())?;
        if let Some(existing) = self.get(id) {
            existing.check_update(payload)?;
        }
        let layout = self.backend.update_report(id, payload).await?;
        tracing::info!(report_id = %layout.id, fields = layout.fields().len(), "Report layout updated");
        self.refresh_after("update").await;
        Ok(layout)
    }

    pub async fn delete(&self, id: ReportId) -> ClientResult<()> {
        let _guard = self.in_flight.acquire(id.to_string())?;
        self.backend.delete_report(id).await?;
        tracing::info!(report_id = %id, "Report layout deleted");
        self.refresh_after("delete").await;
        Ok(())
    }

    async fn refresh_after(&self, operation: &'static str) {
        if let Err(e) = self.refresh().await {
            tracing::warn!(operation, error = %e, "Report refetch after mutation failed");
        }
    }
}

// ============================================================================
// MODEL CATALOG
// ============================================================================

/// Read-only base model catalog with per-model field cache.
pub struct ModelCatalog {
    backend: Arc<dyn Backend>,
    models: RwLock<Vec<ModelInfo>>,
    fields: RwLock<HashMap<String, Vec<ModelField>>>,
}

impl ModelCatalog {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            models: RwLock::new(Vec::new()),
            fields: RwLock::new(HashMap::new()),
        }
    }

    pub fn models(&self) -> Vec<ModelInfo> {
        read_cache(&self.models)
    }

    /// Refetch the model list and drop cached field lists.
    pub async fn refresh(&self) -> ClientResult<Vec<ModelInfo>> {
        let models = self.backend.list_models().await?;
        tracing::debug!(count = models.len(), "Model list refreshed");
        write_cache(&self.models, models.clone());
        self.fields.write().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(models)
    }

    /// Columns of `model_id`, fetched once and cached.
    pub async fn fields(&self, model_id: &str) -> ClientResult<Vec<ModelField>> {
        let cached = self
            .fields
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(model_id)
            .cloned();
        if let Some(fields) = cached {
            return Ok(fields);
        }
        let fields = self.backend.model_fields(model_id).await?;
        self.fields
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model_id.to_string(), fields.clone());
        Ok(fields)
    }
}
