//! Identity types for Ledgerline entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Backend-assigned identifier of a persisted UDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UdfId(pub i64);

/// Backend-assigned identifier of a persisted report layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub i64);

impl UdfId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl ReportId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for UdfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run-time partition key selecting which data snapshot a report runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CycleCode(String);

impl CycleCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CycleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CycleCode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Ticket identifying one report run attempt.
/// UUIDv7 keeps tickets sortable by the time the run started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunTicket(Uuid);

impl RunTicket {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udf_id_serializes_as_bare_integer() {
        let json = serde_json::to_string(&UdfId::new(42)).unwrap();
        assert_eq!(json, "42");
        let back: UdfId = serde_json::from_str("42").unwrap();
        assert_eq!(back, UdfId(42));
    }

    #[test]
    fn test_cycle_code_display() {
        assert_eq!(CycleCode::from("12023").to_string(), "12023");
    }

    #[test]
    fn test_run_tickets_are_distinct() {
        assert_ne!(RunTicket::new(), RunTicket::new());
    }
}
