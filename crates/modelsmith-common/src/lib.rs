//! Shared domain types for the modelsmith generation pipeline.
//!
//! Everything here is plain data: conversation messages, model kinds,
//! execution outcomes and the tabular inputs handed to the sandbox.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Conversation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// A single conversation turn. Never mutated after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }
}

// ── Models ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Revenue,
    Expense,
    CashFlow,
    Custom,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Revenue => "revenue",
            Self::Expense => "expense",
            Self::CashFlow => "cash_flow",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "revenue" => Ok(Self::Revenue),
            "expense" => Ok(Self::Expense),
            "cash_flow" => Ok(Self::CashFlow),
            "custom" => Ok(Self::Custom),
            _ => Err(format!(
                "Invalid model type '{}'. Valid values: revenue, expense, cash_flow, custom",
                s
            )),
        }
    }
}

/// Link from a version back to the conversation and prompt that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Provenance {
    pub conversation_id: Option<Uuid>,
    pub prompt_hash: String,
}

// ── Execution ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    RuntimeError,
    Timeout,
    PolicyViolation,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RuntimeError => "runtime_error",
            Self::Timeout => "timeout",
            Self::PolicyViolation => "policy_violation",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "runtime_error" => Ok(Self::RuntimeError),
            "timeout" => Ok(Self::Timeout),
            "policy_violation" => Ok(Self::PolicyViolation),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// Classified outcome of one sandboxed execution.
///
/// `output` is only populated for `Success`; `error` only for the other
/// states. `stdout` holds whatever the program printed besides the result
/// line, already cut to the sandbox's output bound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: Option<ForecastOutput>,
    #[serde(default)]
    pub stdout: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(output: ForecastOutput, stdout: String, duration_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output: Some(output),
            stdout,
            error: None,
            duration_ms,
        }
    }

    pub fn failure(
        status: ExecutionStatus,
        error: impl Into<String>,
        stdout: String,
        duration_ms: u64,
    ) -> Self {
        Self {
            status,
            output: None,
            stdout,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Same outcome class and payload, ignoring timing. Used to compare
    /// repeated executions of identical code.
    pub fn same_classification(&self, other: &Self) -> bool {
        self.status == other.status && self.output == other.output
    }
}

/// The structured result a forecast program must produce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ForecastOutput {
    Series {
        series: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<serde_json::Map<String, serde_json::Value>>,
    },
    Table {
        table: DataTable,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<serde_json::Map<String, serde_json::Value>>,
    },
}

impl ForecastOutput {
    /// Number of forecast points (series length or table row count).
    pub fn len(&self) -> usize {
        match self {
            Self::Series { series, .. } => series.len(),
            Self::Table { table, .. } => table.rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn series(&self) -> Option<&[f64]> {
        match self {
            Self::Series { series, .. } => Some(series),
            Self::Table { .. } => None,
        }
    }
}

// ── Tabular data ──────────────────────────────────────────────────────

/// Column-named rows of JSON scalars.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl DataTable {
    /// Accepts either `{"columns": [...], "rows": [[...]]}` or a list of
    /// flat records (`[{"date": ..., "revenue": ...}, ...]`). Column order
    /// for records follows the first record.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Object(map) if map.contains_key("columns") => {
                let table: DataTable = serde_json::from_value(value.clone())
                    .map_err(|e| format!("Invalid table: {}", e))?;
                table.validate()?;
                Ok(table)
            }
            serde_json::Value::Array(records) => {
                let mut columns: Vec<String> = Vec::new();
                if let Some(serde_json::Value::Object(first)) = records.first() {
                    columns = first.keys().cloned().collect();
                }
                let mut rows = Vec::with_capacity(records.len());
                for (idx, record) in records.iter().enumerate() {
                    let obj = record
                        .as_object()
                        .ok_or_else(|| format!("Record {} is not an object", idx))?;
                    rows.push(
                        columns
                            .iter()
                            .map(|c| obj.get(c).cloned().unwrap_or(serde_json::Value::Null))
                            .collect(),
                    );
                }
                Ok(Self { columns, rows })
            }
            _ => Err("Expected a {columns, rows} object or a list of records".to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (idx, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(format!(
                    "Row {} has {} cells, expected {}",
                    idx,
                    row.len(),
                    self.columns.len()
                ));
            }
        }
        Ok(())
    }
}
