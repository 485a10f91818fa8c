//! CSV export of report run results.

use crate::report::Row;
use crate::{CycleCode, ExportError};
use csv::WriterBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

static UNSAFE_FILE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s]").expect("Invalid file name regex"));

/// How string cells are quoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CsvQuoting {
    /// Strings wrapped in `"` with no escaping. Embedded quotes, commas and
    /// newlines pass through and can corrupt the column structure.
    #[default]
    Legacy,
    /// Quoting and escaping per RFC 4180.
    Rfc4180,
}

impl fmt::Display for CsvQuoting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsvQuoting::Legacy => f.write_str("legacy"),
            CsvQuoting::Rfc4180 => f.write_str("rfc4180"),
        }
    }
}

/// Rendered CSV and the file name it should be saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvExport {
    pub file_name: String,
    pub contents: String,
}

impl CsvExport {
    /// Write the export into `dir`, creating it if needed.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        fs::create_dir_all(dir).map_err(|e| ExportError::Io(e.to_string()))?;
        let path = dir.join(&self.file_name);
        fs::write(&path, self.contents.as_bytes()).map_err(|e| ExportError::Io(e.to_string()))?;
        tracing::info!(path = %path.display(), bytes = self.contents.len(), "CSV export written");
        Ok(path)
    }
}

/// Remove every character that is neither a word character nor whitespace.
pub fn sanitize_file_name(name: &str) -> String {
    UNSAFE_FILE_CHARS.replace_all(name, "").into_owned()
}

/// `<sanitized report name>_<cycle code>.csv`
pub fn export_file_name(report_name: &str, cycle_code: &CycleCode) -> String {
    format!("{}_{}.csv", sanitize_file_name(report_name), cycle_code)
}

/// Render `rows` restricted to `fields`, in selection order.
///
/// Rejected without producing output when there are no rows or no fields.
pub fn export_csv(
    report_name: &str,
    cycle_code: &CycleCode,
    rows: &[Row],
    fields: &[String],
    quoting: CsvQuoting,
) -> Result<CsvExport, ExportError> {
    if rows.is_empty() {
        return Err(ExportError::NoRows);
    }
    if fields.is_empty() {
        return Err(ExportError::NoFields);
    }

    let contents = match quoting {
        CsvQuoting::Legacy => render_legacy(rows, fields),
        CsvQuoting::Rfc4180 => render_rfc4180(rows, fields)?,
    };
    Ok(CsvExport {
        file_name: export_file_name(report_name, cycle_code),
        contents,
    })
}

fn render_legacy(rows: &[Row], fields: &[String]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(fields.join(","));
    for row in rows {
        let cells: Vec<String> = fields
            .iter()
            .map(|f| match row.get(f) {
                Some(Value::String(s)) => format!("\"{}\"", s),
                other => plain_cell(other),
            })
            .collect();
        lines.push(cells.join(","));
    }
    lines.join("\n")
}

fn render_rfc4180(rows: &[Row], fields: &[String]) -> Result<String, ExportError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record(fields)
        .map_err(|e| ExportError::Encoding(e.to_string()))?;
    for row in rows {
        let cells = fields.iter().map(|f| match row.get(f) {
            Some(Value::String(s)) => s.clone(),
            other => plain_cell(other),
        });
        writer
            .write_record(cells)
            .map_err(|e| ExportError::Encoding(e.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Encoding(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ExportError::Encoding(e.to_string()))
}

/// Non-string cells: numbers and booleans plain, null or missing empty,
/// arrays and objects as compact JSON.
fn plain_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}
