//! Spreadsheet reader for .xlsx, .csv, and .json uploads.
//!
//! Returns loosely-typed cell rows with no header interpretation; deciding
//! which row (if any) is the header is the LLM gateway's job. Enforces the
//! extension allow-list, the size cap, and the single-sheet rule up front so
//! a bad file never produces a partial read.

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

/// Extensions accepted by the reader (and the upload endpoint).
pub const ALLOWED_EXTENSIONS: &[&str] = &["xlsx", "csv", "json"];

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("unsupported extension .{0}; supported: .xlsx, .csv, .json")]
    UnsupportedExtension(String),
    #[error("file size {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },
    #[error("workbook must contain exactly one sheet, found {0}")]
    SheetCount(usize),
    #[error("file is corrupt or unreadable: {0}")]
    Corrupt(String),
    #[error("JSON file must be an array of arrays of scalar values: {0}")]
    BadJson(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single loosely-typed cell. Untagged: serializes as the bare JSON scalar
/// (`null`, number, bool, or string), matching the wire shape of `rowData`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Empty,
}

impl CellValue {
    /// Render the cell as a plain string; `None` for empty cells.
    pub fn as_display(&self) -> Option<String> {
        match self {
            CellValue::Empty => None,
            CellValue::Text(s) if s.is_empty() => None,
            CellValue::Text(s) => Some(s.clone()),
            CellValue::Number(n) => Some(format_number(*n)),
            CellValue::Bool(b) => Some(b.to_string()),
        }
    }
}

/// Parsed file contents before any LLM analysis.
#[derive(Debug, Clone, Serialize)]
pub struct SheetData {
    #[serde(rename = "fileType")]
    pub file_type: String,
    #[serde(rename = "rowData")]
    pub rows: Vec<Vec<CellValue>>,
}

/// Read a spreadsheet from disk. `row_cap` limits the number of returned rows
/// (a larger file yields exactly the cap); `None` reads everything.
pub fn read_rows(path: &Path, max_bytes: u64, row_cap: Option<usize>) -> Result<SheetData, SheetError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(SheetError::UnsupportedExtension(ext));
    }

    let size = std::fs::metadata(path)?.len();
    if size > max_bytes {
        return Err(SheetError::TooLarge { size, max: max_bytes });
    }

    let data = std::fs::read(path)?;
    let rows = match ext.as_str() {
        "xlsx" => parse_xlsx(&data, row_cap)?,
        "csv" => parse_csv(&data, row_cap)?,
        "json" => parse_json(&data, row_cap)?,
        _ => unreachable!("extension checked above"),
    };

    Ok(SheetData {
        file_type: ext,
        rows,
    })
}

/// The workbook must have exactly one sheet; anything else is rejected.
fn ensure_single_sheet(sheet_names: &[String]) -> Result<(), SheetError> {
    if sheet_names.len() == 1 {
        Ok(())
    } else {
        Err(SheetError::SheetCount(sheet_names.len()))
    }
}

fn parse_xlsx(data: &[u8], row_cap: Option<usize>) -> Result<Vec<Vec<CellValue>>, SheetError> {
    let cursor = Cursor::new(data);
    let mut workbook: Xlsx<_> = open_workbook_from_rs(cursor)
        .map_err(|e: calamine::XlsxError| SheetError::Corrupt(e.to_string()))?;

    let sheet_names = workbook.sheet_names().to_vec();
    ensure_single_sheet(&sheet_names)?;

    let range = workbook
        .worksheet_range(&sheet_names[0])
        .map_err(|e| SheetError::Corrupt(e.to_string()))?;

    let mut rows = Vec::new();
    for row in range.rows() {
        if let Some(cap) = row_cap {
            if rows.len() >= cap {
                break;
            }
        }
        rows.push(row.iter().map(cell_to_value).collect());
    }

    Ok(rows)
}

fn parse_csv(data: &[u8], row_cap: Option<usize>) -> Result<Vec<Vec<CellValue>>, SheetError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_reader(data);

    let mut rows = Vec::new();
    for result in reader.records() {
        if let Some(cap) = row_cap {
            if rows.len() >= cap {
                break;
            }
        }
        let record = result.map_err(|e| SheetError::Corrupt(e.to_string()))?;
        rows.push(record.iter().map(str_to_value).collect());
    }

    Ok(rows)
}

fn parse_json(data: &[u8], row_cap: Option<usize>) -> Result<Vec<Vec<CellValue>>, SheetError> {
    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| SheetError::Corrupt(e.to_string()))?;

    let outer = value
        .as_array()
        .ok_or_else(|| SheetError::BadJson("top level is not an array".into()))?;

    let mut rows = Vec::new();
    for (i, row) in outer.iter().enumerate() {
        if let Some(cap) = row_cap {
            if rows.len() >= cap {
                break;
            }
        }
        let cells = row
            .as_array()
            .ok_or_else(|| SheetError::BadJson(format!("row {} is not an array", i)))?;

        let mut parsed = Vec::with_capacity(cells.len());
        for (j, cell) in cells.iter().enumerate() {
            parsed.push(match cell {
                serde_json::Value::Null => CellValue::Empty,
                serde_json::Value::Bool(b) => CellValue::Bool(*b),
                serde_json::Value::Number(n) => {
                    CellValue::Number(n.as_f64().unwrap_or_default())
                }
                serde_json::Value::String(s) => CellValue::Text(s.clone()),
                other => {
                    return Err(SheetError::BadJson(format!(
                        "row {} cell {} is not a scalar: {}",
                        i, j, other
                    )))
                }
            });
        }
        rows.push(parsed);
    }

    Ok(rows)
}

/// Convert a calamine cell to a loosely-typed value.
fn cell_to_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::Text(excel_serial_to_iso(dt.as_f64())),
        Data::DateTimeIso(s) => CellValue::Text(s.clone()),
        Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(e) => CellValue::Text(format!("#ERR:{:?}", e)),
    }
}

/// Interpret a CSV field: empty → Empty, numeric → Number, otherwise Text.
fn str_to_value(field: &str) -> CellValue {
    if field.is_empty() {
        return CellValue::Empty;
    }
    if let Ok(n) = field.parse::<f64>() {
        if n.is_finite() {
            return CellValue::Number(n);
        }
    }
    CellValue::Text(field.to_string())
}

/// Avoid a trailing ".0" for whole numbers.
fn format_number(n: f64) -> String {
    if n == n.trunc() && n.abs() < i64::MAX as f64 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Convert an Excel serial date to an ISO8601 string. Serials past the
/// phantom 1900-02-29 count from 1899-12-30, earlier ones from 1899-12-31.
fn excel_serial_to_iso(serial: f64) -> String {
    let days = serial.trunc() as i64;
    let unix_days = if days > 59 { days - 25569 } else { days - 25568 };
    let frac = serial - serial.trunc();

    let (year, month, day) = civil_from_days(unix_days);

    let secs = (frac * 86400.0).round() as i64;
    if secs == 0 {
        format!("{:04}-{:02}-{:02}", year, month, day)
    } else {
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year,
            month,
            day,
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    }
}

/// Days since 1970-01-01 to (year, month, day), Gregorian calendar.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = (if z >= 0 { z } else { z - 146096 }) / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}_{}", Uuid::new_v4().simple(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn csv_rows_are_loosely_typed() {
        let path = temp_file("basic.csv", b"name,age,city\nAlice,30,SP\nBob,,RJ\n");
        let sheet = read_rows(&path, 1024, None).unwrap();
        assert_eq!(sheet.file_type, "csv");
        assert_eq!(sheet.rows.len(), 3);
        assert_eq!(sheet.rows[1][0], CellValue::Text("Alice".into()));
        assert_eq!(sheet.rows[1][1], CellValue::Number(30.0));
        assert_eq!(sheet.rows[2][1], CellValue::Empty);
    }

    #[test]
    fn row_cap_is_exact() {
        let mut csv = String::from("a,b\n");
        for i in 0..200 {
            csv.push_str(&format!("r{},v{}\n", i, i));
        }
        let path = temp_file("large.csv", csv.as_bytes());
        let sheet = read_rows(&path, u64::MAX, Some(100)).unwrap();
        assert_eq!(sheet.rows.len(), 100);
    }

    #[test]
    fn unsupported_extension_rejected() {
        let path = temp_file("notes.txt", b"data");
        let err = read_rows(&path, u64::MAX, None).unwrap_err();
        assert!(matches!(err, SheetError::UnsupportedExtension(ref e) if e == "txt"));
    }

    #[test]
    fn corrupt_xlsx_rejected() {
        let path = temp_file("broken.xlsx", b"this is not a zip archive");
        let err = read_rows(&path, u64::MAX, None).unwrap_err();
        assert!(matches!(err, SheetError::Corrupt(_)));
    }

    #[test]
    fn oversized_file_rejected_before_parse() {
        let path = temp_file("big.csv", b"a,b\n1,2\n");
        let err = read_rows(&path, 3, None).unwrap_err();
        assert!(matches!(err, SheetError::TooLarge { .. }));
    }

    #[test]
    fn multi_sheet_workbook_rejected() {
        let names = vec!["Sheet1".to_string(), "Sheet2".to_string()];
        let err = ensure_single_sheet(&names).unwrap_err();
        assert!(matches!(err, SheetError::SheetCount(2)));
        assert!(ensure_single_sheet(&["Only".to_string()]).is_ok());
    }

    #[test]
    fn json_array_of_arrays() {
        let path = temp_file("rows.json", br#"[["D001","ABC",1],[null,"XYZ",2.5]]"#);
        let sheet = read_rows(&path, u64::MAX, None).unwrap();
        assert_eq!(sheet.rows[0][2], CellValue::Number(1.0));
        assert_eq!(sheet.rows[1][0], CellValue::Empty);
    }

    #[test]
    fn json_object_rejected() {
        let path = temp_file("bad.json", br#"{"rows": []}"#);
        let err = read_rows(&path, u64::MAX, None).unwrap_err();
        assert!(matches!(err, SheetError::BadJson(_)));
    }

    #[test]
    fn excel_serial_dates() {
        assert_eq!(excel_serial_to_iso(45292.0), "2024-01-01");
        // Serial 1 is 1900-01-01 (before the phantom leap day)
        assert_eq!(excel_serial_to_iso(1.0), "1900-01-01");
        assert_eq!(excel_serial_to_iso(45292.5), "2024-01-01 12:00:00");
    }

    #[test]
    fn cell_display_formatting() {
        assert_eq!(CellValue::Number(42.0).as_display().unwrap(), "42");
        assert_eq!(CellValue::Number(1.5).as_display().unwrap(), "1.5");
        assert_eq!(CellValue::Empty.as_display(), None);
        assert_eq!(CellValue::Text(String::new()).as_display(), None);
    }
}
