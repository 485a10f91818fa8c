//! Error types for the client services.

use crate::config::ConfigError;
use ledgerline_core::{
    EntityKind, ExportError, IntegrityError, LedgerError, RequestError, RunError, ValidationError,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{entity} {id} already has a save or delete in flight")]
    Busy { entity: EntityKind, id: String },
    #[error("HTTP client setup failed: {0}")]
    Http(String),
    #[error("Tracing setup failed: {0}")]
    Telemetry(String),
}

impl ClientError {
    /// The wrapped core error, if any.
    pub fn as_ledger(&self) -> Option<&LedgerError> {
        match self {
            ClientError::Ledger(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ClientError::Ledger(LedgerError::Validation(_)))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, ClientError::Ledger(LedgerError::Request(_)))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, ClientError::Ledger(LedgerError::Integrity(_)))
    }
}

impl From<ValidationError> for ClientError {
    fn from(err: ValidationError) -> Self {
        ClientError::Ledger(err.into())
    }
}

impl From<RequestError> for ClientError {
    fn from(err: RequestError) -> Self {
        ClientError::Ledger(err.into())
    }
}

impl From<IntegrityError> for ClientError {
    fn from(err: IntegrityError) -> Self {
        ClientError::Ledger(err.into())
    }
}

impl From<ExportError> for ClientError {
    fn from(err: ExportError) -> Self {
        ClientError::Ledger(err.into())
    }
}

impl From<RunError> for ClientError {
    fn from(err: RunError) -> Self {
        ClientError::Ledger(err.into())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerline_core::UdfId;

    #[test]
    fn test_sub_errors_wrap_into_ledger() {
        let err = ClientError::from(RequestError::failed("list UDFs", "timeout"));
        assert!(err.is_request());
        assert_eq!(err.to_string(), "Request error: list UDFs failed: timeout");

        let err = ClientError::from(IntegrityError::MissingUdf {
            report: "Monthly".to_string(),
            udf_id: UdfId(4),
        });
        assert!(err.is_integrity());
        assert!(!err.is_validation());
    }

    #[test]
    fn test_busy_display() {
        let err = ClientError::Busy {
            entity: EntityKind::Udf,
            id: "3".to_string(),
        };
        assert_eq!(err.to_string(), "UDF 3 already has a save or delete in flight");
        assert!(err.as_ledger().is_none());
    }
}
