//! Calculation registry sources.
//!
//! A source answers "which calculation kinds exist at this level". The
//! editor turns the answer into a [`DraftEvent`]; a failed lookup degrades
//! to an empty catalog and never blocks the rest of the draft.

use async_trait::async_trait;
use ledgerline_core::calculation::BUILTIN_DEFINITIONS;
use ledgerline_core::{AggregationLevel, Backend, CalculationCatalog, DraftEvent, LedgerResult};
use std::sync::Arc;

#[async_trait]
pub trait CalculationSource: Send + Sync {
    async fn resolve(&self, level: AggregationLevel) -> LedgerResult<CalculationCatalog>;
}

/// Registry served by the backend.
pub struct RemoteRegistry {
    backend: Arc<dyn Backend>,
}

impl RemoteRegistry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl CalculationSource for RemoteRegistry {
    async fn resolve(&self, level: AggregationLevel) -> LedgerResult<CalculationCatalog> {
        let definitions = self.backend.list_calculations(level).await?;
        Ok(CalculationCatalog::new(level, definitions))
    }
}

/// The seven built-in calculation kinds, for offline use.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticRegistry;

#[async_trait]
impl CalculationSource for StaticRegistry {
    async fn resolve(&self, level: AggregationLevel) -> LedgerResult<CalculationCatalog> {
        Ok(CalculationCatalog::new(level, BUILTIN_DEFINITIONS.clone()))
    }
}

/// Resolve `level` and express the outcome as a draft event.
pub async fn resolve_event(source: &dyn CalculationSource, level: AggregationLevel) -> DraftEvent {
    match source.resolve(level).await {
        Ok(catalog) => {
            tracing::debug!(level = %level, calculations = catalog.definitions().len(), "Calculation catalog resolved");
            DraftEvent::CatalogResolved(catalog)
        }
        Err(e) => {
            tracing::warn!(level = %level, error = %e, "Calculation catalog unavailable");
            DraftEvent::CatalogFailed {
                level,
                message: e.to_string(),
            }
        }
    }
}
