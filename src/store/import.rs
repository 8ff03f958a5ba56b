//! CSV import for data sources.
//!
//! A header row names the columns. Each column gets one inferred type and
//! every cell in it is converted to that type; empty cells become `null`.

use modelsmith_common::DataTable;
use serde::Serialize;
use serde_json::{Number, Value};

/// Rows returned by a preview.
pub const PREVIEW_ROWS: usize = 10;

/// Upper bound on imported rows.
pub const MAX_IMPORT_ROWS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Number,
    Boolean,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
}

/// A parsed upload: the full typed table plus its detected schema.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvImport {
    pub table: DataTable,
    pub schema: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CsvPreview {
    pub columns: Vec<String>,
    pub schema: Vec<ColumnSchema>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
}

impl CsvImport {
    pub fn preview(&self) -> CsvPreview {
        CsvPreview {
            columns: self.table.columns.clone(),
            schema: self.schema.clone(),
            rows: self.table.rows.iter().take(PREVIEW_ROWS).cloned().collect(),
            row_count: self.table.rows.len(),
        }
    }
}

fn parse_bool(cell: &str) -> Option<bool> {
    match cell.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn infer(cells: &[&str]) -> ColumnType {
    let present: Vec<&str> = cells.iter().copied().filter(|c| !c.is_empty()).collect();
    if present.is_empty() {
        return ColumnType::String;
    }
    if present.iter().all(|c| c.parse::<i64>().is_ok()) {
        ColumnType::Integer
    } else if present
        .iter()
        .all(|c| c.parse::<f64>().is_ok_and(|v| v.is_finite()))
    {
        ColumnType::Number
    } else if present.iter().all(|c| parse_bool(c).is_some()) {
        ColumnType::Boolean
    } else {
        ColumnType::String
    }
}

fn convert(cell: &str, kind: ColumnType) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    match kind {
        ColumnType::Integer => cell
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(cell.to_string())),
        ColumnType::Number => cell
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(cell.to_string())),
        ColumnType::Boolean => parse_bool(cell)
            .map(Value::Bool)
            .unwrap_or_else(|| Value::String(cell.to_string())),
        ColumnType::String => Value::String(cell.to_string()),
    }
}

/// Parse CSV text with a header row into a typed table.
pub fn parse_csv(text: &str) -> Result<CsvImport, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| format!("Invalid CSV header: {}", e))?
        .iter()
        .map(str::to_string)
        .collect();
    if columns.is_empty() || columns.iter().all(|c| c.is_empty()) {
        return Err("CSV has no header row".to_string());
    }
    if let Some(idx) = columns.iter().position(|c| c.is_empty()) {
        return Err(format!("Column {} has an empty name", idx + 1));
    }

    let mut records = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("Invalid CSV row {}: {}", idx + 1, e))?;
        if records.len() == MAX_IMPORT_ROWS {
            return Err(format!("CSV has more than {} rows", MAX_IMPORT_ROWS));
        }
        records.push(record);
    }

    let schema: Vec<ColumnSchema> = columns
        .iter()
        .enumerate()
        .map(|(col, name)| {
            let cells: Vec<&str> = records.iter().map(|r| r.get(col).unwrap_or("")).collect();
            ColumnSchema {
                name: name.clone(),
                kind: infer(&cells),
            }
        })
        .collect();

    let rows = records
        .iter()
        .map(|record| {
            schema
                .iter()
                .enumerate()
                .map(|(col, column)| convert(record.get(col).unwrap_or(""), column.kind))
                .collect()
        })
        .collect();

    Ok(CsvImport {
        table: DataTable { columns, rows },
        schema,
    })
}
