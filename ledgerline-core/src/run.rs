//! Per-report run state machine.
//!
//! `Idle -> Running -> Succeeded | Failed`, and from either terminal state
//! back through `Running` on the next run. One run per report at a time.
//! The last successful response survives later runs until `reset`.

use crate::export::{export_csv, CsvExport, CsvQuoting};
use crate::report::{ReportRunResponse, Row};
use crate::{CycleCode, LedgerError, LedgerResult, ReportId, RunError, RunTicket, Timestamp};
use chrono::Utc;

#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Idle,
    Running {
        ticket: RunTicket,
        cycle_code: CycleCode,
        started_at: Timestamp,
    },
    Succeeded {
        response: ReportRunResponse,
        finished_at: Timestamp,
    },
    Failed {
        cycle_code: CycleCode,
        error: LedgerError,
        finished_at: Timestamp,
    },
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running { .. } => "running",
            RunState::Succeeded { .. } => "succeeded",
            RunState::Failed { .. } => "failed",
        }
    }
}

/// Run tracking for one report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRun {
    report_id: ReportId,
    state: RunState,
    last_success: Option<ReportRunResponse>,
}

impl ReportRun {
    pub fn new(report_id: ReportId) -> Self {
        Self {
            report_id,
            state: RunState::Idle,
            last_success: None,
        }
    }

    pub fn report_id(&self) -> ReportId {
        self.report_id
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Enter `Running`. Rejected while a run is already in flight.
    pub fn begin(&mut self, cycle_code: CycleCode) -> Result<RunTicket, RunError> {
        if self.state.is_running() {
            return Err(RunError::AlreadyRunning {
                report_id: self.report_id,
            });
        }
        let ticket = RunTicket::new();
        tracing::debug!(report_id = %self.report_id, ticket = %ticket, cycle_code = %cycle_code, "Report run started");
        self.state = RunState::Running {
            ticket,
            cycle_code,
            started_at: Utc::now(),
        };
        Ok(ticket)
    }

    /// Record the outcome of the run identified by `ticket`.
    ///
    /// Returns `false` and leaves the state alone when `ticket` is not the
    /// run currently in flight.
    pub fn complete(&mut self, ticket: RunTicket, outcome: LedgerResult<ReportRunResponse>) -> bool {
        let cycle_code = match &self.state {
            RunState::Running {
                ticket: current,
                cycle_code,
                ..
            } if *current == ticket => cycle_code.clone(),
            _ => {
                tracing::debug!(report_id = %self.report_id, ticket = %ticket, "Ignoring stale run completion");
                return false;
            }
        };

        let finished_at = Utc::now();
        self.state = match outcome {
            Ok(response) => {
                tracing::info!(report_id = %self.report_id, rows = response.data.len(), "Report run succeeded");
                self.last_success = Some(response.clone());
                RunState::Succeeded {
                    response,
                    finished_at,
                }
            }
            Err(error) => {
                tracing::warn!(report_id = %self.report_id, error = %error, "Report run failed");
                RunState::Failed {
                    cycle_code,
                    error,
                    finished_at,
                }
            }
        };
        true
    }

    /// Abandon the in-flight run identified by `ticket` without an outcome.
    ///
    /// Returns `false` when `ticket` is not the run currently in flight.
    pub fn abandon(&mut self, ticket: RunTicket) -> bool {
        match &self.state {
            RunState::Running { ticket: current, .. } if *current == ticket => {
                tracing::debug!(report_id = %self.report_id, ticket = %ticket, "Report run abandoned");
                self.state = RunState::Idle;
                true
            }
            _ => false,
        }
    }

    /// Rows of the last successful run.
    pub fn rows(&self) -> Option<&[Row]> {
        self.last_success.as_ref().map(|response| response.data.as_slice())
    }

    pub fn response(&self) -> Option<&ReportRunResponse> {
        self.last_success.as_ref()
    }

    /// Export the last successful run's rows restricted to `fields`.
    pub fn export(&self, fields: &[String], quoting: CsvQuoting) -> LedgerResult<CsvExport> {
        let response = self.response().ok_or(RunError::NoSuccessfulRun {
            report_id: self.report_id,
        })?;
        Ok(export_csv(
            &response.report_name,
            &response.cycle_code,
            &response.data,
            fields,
            quoting,
        )?)
    }

    /// Return to `Idle` and drop the last successful response.
    pub fn reset(&mut self) {
        self.state = RunState::Idle;
        self.last_success = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExportError, RequestError};
    use serde_json::json;

    fn response(rows: usize) -> ReportRunResponse {
        ReportRunResponse {
            report_name: "Monthly Deals".to_string(),
            cycle_code: CycleCode::from("12023"),
            data: (0..rows)
                .filter_map(|i| json!({"A.x": i}).as_object().cloned())
                .collect(),
        }
    }

    #[test]
    fn test_second_run_rejected_while_running() {
        let mut run = ReportRun::new(ReportId(1));
        run.begin(CycleCode::from("12023")).unwrap();
        assert_eq!(
            run.begin(CycleCode::from("12022")),
            Err(RunError::AlreadyRunning {
                report_id: ReportId(1)
            })
        );
    }

    #[test]
    fn test_rerun_after_terminal_state() {
        let mut run = ReportRun::new(ReportId(1));
        let ticket = run.begin(CycleCode::from("12023")).unwrap();
        assert!(run.complete(
            ticket,
            Err(RequestError::failed("run report", "boom").into())
        ));
        assert_eq!(run.state().name(), "failed");

        let ticket = run.begin(CycleCode::from("12023")).unwrap();
        assert!(run.complete(ticket, Ok(response(2))));
        assert_eq!(run.rows().map(<[Row]>::len), Some(2));
    }

    #[test]
    fn test_stale_ticket_ignored() {
        let mut run = ReportRun::new(ReportId(1));
        let first = run.begin(CycleCode::from("12023")).unwrap();
        assert!(run.complete(first, Ok(response(1))));
        let second = run.begin(CycleCode::from("12023")).unwrap();

        assert!(!run.complete(first, Ok(response(5))));
        assert!(run.state().is_running());
        assert!(run.complete(second, Ok(response(3))));
        assert_eq!(run.rows().map(<[Row]>::len), Some(3));
    }

    #[test]
    fn test_export_requires_successful_run() {
        let run = ReportRun::new(ReportId(2));
        assert_eq!(
            run.export(&["A.x".to_string()], CsvQuoting::Legacy),
            Err(LedgerError::Run(RunError::NoSuccessfulRun {
                report_id: ReportId(2)
            }))
        );
    }

    #[test]
    fn test_export_uses_response_name_and_cycle() {
        let mut run = ReportRun::new(ReportId(2));
        let ticket = run.begin(CycleCode::from("12023")).unwrap();
        run.complete(ticket, Ok(response(1)));
        let export = run.export(&["A.x".to_string()], CsvQuoting::Legacy).unwrap();
        assert_eq!(export.file_name, "Monthly Deals_12023.csv");
        assert_eq!(export.contents, "A.x\n0");

        assert_eq!(
            run.export(&[], CsvQuoting::Legacy),
            Err(LedgerError::Export(ExportError::NoFields))
        );
    }

    #[test]
    fn test_last_success_survives_rerun_and_failure() {
        let mut run = ReportRun::new(ReportId(1));
        let fields = ["A.x".to_string()];
        let ticket = run.begin(CycleCode::from("12023")).unwrap();
        run.complete(ticket, Ok(response(1)));

        let ticket = run.begin(CycleCode::from("12024")).unwrap();
        assert!(run.state().is_running());
        assert_eq!(
            run.export(&fields, CsvQuoting::Legacy).unwrap().contents,
            "A.x\n0"
        );

        assert!(run.complete(
            ticket,
            Err(RequestError::failed("run report", "boom").into())
        ));
        assert_eq!(run.state().name(), "failed");
        assert_eq!(run.rows().map(<[Row]>::len), Some(1));
        let export = run.export(&fields, CsvQuoting::Legacy).unwrap();
        assert_eq!(export.file_name, "Monthly Deals_12023.csv");

        run.reset();
        assert_eq!(run.response(), None);
        assert!(run.export(&fields, CsvQuoting::Legacy).is_err());
    }

    #[test]
    fn test_abandon_only_matches_current_ticket() {
        let mut run = ReportRun::new(ReportId(1));
        let first = run.begin(CycleCode::from("12023")).unwrap();
        run.complete(first, Ok(response(2)));
        let second = run.begin(CycleCode::from("12023")).unwrap();

        assert!(!run.abandon(first));
        assert!(run.state().is_running());
        assert!(run.abandon(second));
        assert_eq!(run.state(), &RunState::Idle);
        assert_eq!(run.rows().map(<[Row]>::len), Some(2));
        assert!(run.begin(CycleCode::from("12023")).is_ok());
    }
}
