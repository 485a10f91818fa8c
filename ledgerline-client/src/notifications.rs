//! User-facing notifications derived from service outcomes.

use crate::error::ClientError;
use chrono::{DateTime, Utc};
use ledgerline_core::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    Retry,
    Dismiss,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub action: Option<NotificationAction>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            action: None,
            created_at: Utc::now(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Success, message)
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }
}

impl From<&ClientError> for Notification {
    /// Backend failures are retryable errors; local validation and empty
    /// exports are warnings; integrity problems are errors that retrying
    /// does not fix.
    fn from(err: &ClientError) -> Self {
        match err {
            ClientError::Ledger(LedgerError::Request(_)) => {
                Notification::new(NotificationLevel::Error, err.to_string())
                    .with_action(NotificationAction::Retry)
            }
            ClientError::Ledger(LedgerError::Validation(_))
            | ClientError::Ledger(LedgerError::Export(_))
            | ClientError::Ledger(LedgerError::Run(_))
            | ClientError::Busy { .. } => {
                Notification::new(NotificationLevel::Warning, err.to_string())
            }
            ClientError::Ledger(LedgerError::Integrity(_))
            | ClientError::Config(_)
            | ClientError::Http(_)
            | ClientError::Telemetry(_) => {
                Notification::new(NotificationLevel::Error, err.to_string())
                    .with_action(NotificationAction::Dismiss)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerline_core::{ExportError, IntegrityError, RequestError, UdfId};

    #[test]
    fn test_request_failure_is_retryable() {
        let err = ClientError::from(RequestError::failed("list UDFs", "timeout"));
        let note = Notification::from(&err);
        assert_eq!(note.level, NotificationLevel::Error);
        assert_eq!(note.action, Some(NotificationAction::Retry));
        assert!(note.message.contains("timeout"));
    }

    #[test]
    fn test_empty_export_is_a_warning() {
        let note = Notification::from(&ClientError::from(ExportError::NoRows));
        assert_eq!(note.level, NotificationLevel::Warning);
        assert_eq!(note.action, None);
    }

    #[test]
    fn test_integrity_error_not_retryable() {
        let err = ClientError::from(IntegrityError::MissingUdf {
            report: "Monthly".to_string(),
            udf_id: UdfId(2),
        });
        let note = Notification::from(&err);
        assert_eq!(note.level, NotificationLevel::Error);
        assert_eq!(note.action, Some(NotificationAction::Dismiss));
    }
}
