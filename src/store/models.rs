use modelsmith_common::{DataTable, ExecutionResult, ModelType, Provenance};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named financial model. `current_version` is the sequence number of the
/// latest committed version, `None` until the first commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Model {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub model_type: ModelType,
    pub description: String,
    pub is_public: bool,
    pub current_version: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl Model {
    pub fn can_read(&self, owner: &str) -> bool {
        self.is_public || self.owner == owner
    }
}

/// Named reference from a version to the data source it ran against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputRef {
    pub name: String,
    pub source_id: i64,
}

/// Immutable snapshot of one successful execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Version {
    pub id: i64,
    pub model_id: i64,
    pub seq: i64,
    pub code: String,
    pub parameters: Map<String, Value>,
    pub inputs: Vec<InputRef>,
    pub result: ExecutionResult,
    pub provenance: Provenance,
    pub created_at: String,
}

/// Everything needed to commit a version. `expected_current` enables the
/// optimistic check: the commit fails unless the model's current version
/// still equals it (`Some(0)` means "no versions yet").
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub code: String,
    pub parameters: Map<String, Value>,
    pub inputs: Vec<InputRef>,
    pub result: ExecutionResult,
    pub provenance: Provenance,
    pub expected_current: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewModel {
    pub owner: String,
    pub name: String,
    pub model_type: ModelType,
    pub description: String,
    pub is_public: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelQuery {
    pub model_type: Option<ModelType>,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

impl Default for ModelQuery {
    fn default() -> Self {
        Self {
            model_type: None,
            skip: 0,
            limit: default_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_public: Option<bool>,
}

/// Partial data source change; a new table replaces the stored one whole.
#[derive(Debug, Clone, Default)]
pub struct DataSourceUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub table: Option<DataTable>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// Versions exist: hidden from reads and the name is freed.
    SoftDeleted,
    Deleted,
}

/// Owner-scoped stored table usable as an execution input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSource {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub description: String,
    pub table: DataTable,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSourceSummary {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub created_at: String,
}

impl From<&DataSource> for DataSourceSummary {
    fn from(source: &DataSource) -> Self {
        Self {
            id: source.id,
            name: source.name.clone(),
            description: source.description.clone(),
            columns: source.table.columns.clone(),
            row_count: source.table.rows.len(),
            created_at: source.created_at.clone(),
        }
    }
}
