//! Report execution and CSV export.

use crate::error::ClientResult;
use crate::repository::UdfRepository;
use ledgerline_core::{
    ensure_integrity, Backend, CsvExport, CsvQuoting, CycleCode, LedgerResult, ReportId,
    ReportLayout, ReportRun, ReportRunRequest, ReportRunResponse, RunError, RunState, RunTicket,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Runs report layouts for a cycle and exports the last successful result.
///
/// Keeps one [`ReportRun`] per report; at most one run per report is in
/// flight at a time.
pub struct ReportRunner {
    backend: Arc<dyn Backend>,
    udfs: Arc<UdfRepository>,
    runs: Mutex<HashMap<ReportId, ReportRun>>,
    quoting: CsvQuoting,
    export_dir: PathBuf,
}

impl ReportRunner {
    pub fn new(
        backend: Arc<dyn Backend>,
        udfs: Arc<UdfRepository>,
        quoting: CsvQuoting,
        export_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            udfs,
            runs: Mutex::new(HashMap::new()),
            quoting,
            export_dir: export_dir.into(),
        }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<ReportId, ReportRun>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn available_cycles(&self) -> ClientResult<Vec<CycleCode>> {
        Ok(self.backend.list_cycles().await?)
    }

    /// Current run state of `report_id`.
    pub fn state(&self, report_id: ReportId) -> RunState {
        self.runs()
            .get(&report_id)
            .map(|run| run.state().clone())
            .unwrap_or(RunState::Idle)
    }

    pub async fn run(&self, layout: &ReportLayout, cycle_code: CycleCode) -> ClientResult<ReportRunResponse> {
        self.execute(layout, ReportRunRequest::new(layout.id, cycle_code))
            .await
    }

    /// Run restricted by equality filters on primary-model columns.
    pub async fn run_filtered(
        &self,
        layout: &ReportLayout,
        cycle_code: CycleCode,
        filters: BTreeMap<String, Value>,
    ) -> ClientResult<ReportRunResponse> {
        let mut request = ReportRunRequest::new(layout.id, cycle_code);
        request.filters = (!filters.is_empty()).then_some(filters);
        self.execute(layout, request).await
    }

    async fn execute(&self, layout: &ReportLayout, request: ReportRunRequest) -> ClientResult<ReportRunResponse> {
        if let Err(e) = ensure_integrity(layout, &self.udfs.udfs()) {
            tracing::warn!(report_id = %layout.id, error = %e, "Refusing to run report");
            return Err(e.into());
        }

        let ticket = self
            .runs()
            .entry(layout.id)
            .or_insert_with(|| ReportRun::new(layout.id))
            .begin(request.cycle_code.clone())?;
        let pending = PendingRun {
            runner: self,
            report_id: layout.id,
            ticket: Some(ticket),
        };

        let outcome = self.backend.run_report(&request).await;

        pending.complete(outcome.clone());
        Ok(outcome?)
    }

    /// CSV of the last successful run, restricted to the layout's fields.
    pub fn export(&self, layout: &ReportLayout) -> ClientResult<CsvExport> {
        let runs = self.runs();
        let run = runs.get(&layout.id).ok_or(RunError::NoSuccessfulRun {
            report_id: layout.id,
        })?;
        Ok(run.export(layout.fields(), self.quoting)?)
    }

    /// Export and write into the configured export directory.
    pub fn export_to_dir(&self, layout: &ReportLayout) -> ClientResult<PathBuf> {
        let export = self.export(layout)?;
        Ok(export.write_to_dir(&self.export_dir)?)
    }

    /// Forget the run history of `report_id`.
    pub fn reset(&self, report_id: ReportId) {
        if let Some(run) = self.runs().get_mut(&report_id) {
            run.reset();
        }
    }
}

/// An in-flight run. Dropping it before completion returns the report to
/// `Idle` so a cancelled future does not leave it `Running`.
struct PendingRun<'a> {
    runner: &'a ReportRunner,
    report_id: ReportId,
    ticket: Option<RunTicket>,
}

impl PendingRun<'_> {
    fn complete(mut self, outcome: LedgerResult<ReportRunResponse>) {
        if let Some(ticket) = self.ticket.take() {
            if let Some(run) = self.runner.runs().get_mut(&self.report_id) {
                run.complete(ticket, outcome);
            }
        }
    }
}

impl Drop for PendingRun<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            if let Some(run) = self.runner.runs().get_mut(&self.report_id) {
                run.abandon(ticket);
            }
        }
    }
}
