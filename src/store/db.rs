use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use modelsmith_common::{DataTable, ExecutionResult, ModelType, Provenance};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::models::*;
use crate::errors::StoreError;

/// Async-safe handle to the model database.
///
/// Wraps `ModelDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. The mutex also serializes
/// commits, so sequence assignment never races inside one process; the
/// `UNIQUE(model_id, seq)` constraint covers everything else.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ModelDb>>,
}

impl DbHandle {
    pub fn new(db: ModelDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&ModelDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

pub struct ModelDb {
    conn: Connection,
}

const MODEL_COLUMNS: &str = "id, owner, name, model_type, description, is_public, current_version, created_at, updated_at";

const VERSION_COLUMNS: &str = "id, model_id, seq, code, parameters, inputs, result, conversation_id, prompt_hash, created_at";

const DATA_SOURCE_COLUMNS: &str = "id, owner, name, description, columns, rows, created_at";

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Corrupt(format!("{}: {}", what, e)))
}

/// Raw `models` row before enum and flag conversion.
struct ModelRow {
    id: i64,
    owner: String,
    name: String,
    model_type: String,
    description: String,
    is_public: bool,
    current_version: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl ModelRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            name: row.get(2)?,
            model_type: row.get(3)?,
            description: row.get(4)?,
            is_public: row.get(5)?,
            current_version: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_model(self) -> Result<Model, StoreError> {
        let model_type: ModelType = self.model_type.parse().map_err(StoreError::Corrupt)?;
        Ok(Model {
            id: self.id,
            owner: self.owner,
            name: self.name,
            model_type,
            description: self.description,
            is_public: self.is_public,
            current_version: self.current_version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct VersionRow {
    id: i64,
    model_id: i64,
    seq: i64,
    code: String,
    parameters: String,
    inputs: String,
    result: String,
    conversation_id: Option<String>,
    prompt_hash: String,
    created_at: String,
}

impl VersionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            model_id: row.get(1)?,
            seq: row.get(2)?,
            code: row.get(3)?,
            parameters: row.get(4)?,
            inputs: row.get(5)?,
            result: row.get(6)?,
            conversation_id: row.get(7)?,
            prompt_hash: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_version(self) -> Result<Version, StoreError> {
        let conversation_id = self
            .conversation_id
            .map(|id| Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()?;
        Ok(Version {
            id: self.id,
            model_id: self.model_id,
            seq: self.seq,
            code: self.code,
            parameters: from_json(&self.parameters, "version parameters")?,
            inputs: from_json(&self.inputs, "version inputs")?,
            result: from_json::<ExecutionResult>(&self.result, "version result")?,
            provenance: Provenance {
                conversation_id,
                prompt_hash: self.prompt_hash,
            },
            created_at: self.created_at,
        })
    }
}

struct DataSourceRow {
    id: i64,
    owner: String,
    name: String,
    description: String,
    columns: String,
    rows: String,
    created_at: String,
}

impl DataSourceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            columns: row.get(4)?,
            rows: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_data_source(self) -> Result<DataSource, StoreError> {
        Ok(DataSource {
            id: self.id,
            owner: self.owner,
            name: self.name,
            description: self.description,
            table: DataTable {
                columns: from_json(&self.columns, "data source columns")?,
                rows: from_json(&self.rows, "data source rows")?,
            },
            created_at: self.created_at,
        })
    }
}

impl ModelDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                model_type TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                is_public INTEGER NOT NULL DEFAULT 0,
                current_version INTEGER,
                deleted_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id INTEGER NOT NULL REFERENCES models(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                code TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT '{}',
                inputs TEXT NOT NULL DEFAULT '[]',
                result TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status = 'success'),
                conversation_id TEXT,
                prompt_hash TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(model_id, seq)
            );

            CREATE TABLE IF NOT EXISTS data_sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                columns TEXT NOT NULL,
                rows TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_models_owner_name
                ON models(owner, name) WHERE deleted_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_models_owner ON models(owner, model_type);
            CREATE INDEX IF NOT EXISTS idx_versions_model ON versions(model_id, seq);
            CREATE INDEX IF NOT EXISTS idx_data_sources_owner ON data_sources(owner);
            ",
        )?;
        Ok(())
    }

    // ── Models ────────────────────────────────────────────────────────

    fn fetch_model(conn: &Connection, id: i64) -> Result<Option<Model>, StoreError> {
        let sql = format!(
            "SELECT {} FROM models WHERE id = ?1 AND deleted_at IS NULL",
            MODEL_COLUMNS
        );
        conn.query_row(&sql, params![id], ModelRow::from_row)
            .optional()?
            .map(ModelRow::into_model)
            .transpose()
    }

    fn insert_model(conn: &Connection, new: &NewModel) -> Result<i64, StoreError> {
        conn.execute(
            "INSERT INTO models (owner, name, model_type, description, is_public)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.owner,
                new.name,
                new.model_type.as_str(),
                new.description,
                new.is_public
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateName {
                    name: new.name.clone(),
                }
            } else {
                StoreError::Database(e)
            }
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Model readable by `owner` (their own, or public).
    pub fn get_model(&self, owner: &str, id: i64) -> Result<Model, StoreError> {
        let model =
            Self::fetch_model(&self.conn, id)?.ok_or(StoreError::ModelNotFound { id })?;
        if !model.can_read(owner) {
            return Err(StoreError::Forbidden);
        }
        Ok(model)
    }

    /// Model `owner` may mutate.
    fn owned_model(conn: &Connection, owner: &str, id: i64) -> Result<Model, StoreError> {
        let model = Self::fetch_model(conn, id)?.ok_or(StoreError::ModelNotFound { id })?;
        if model.owner != owner {
            return Err(StoreError::Forbidden);
        }
        Ok(model)
    }

    pub fn create_model(&self, new: &NewModel) -> Result<Model, StoreError> {
        let id = Self::insert_model(&self.conn, new)?;
        Self::fetch_model(&self.conn, id)?.ok_or(StoreError::ModelNotFound { id })
    }

    /// The owner's live models, oldest first.
    pub fn list_models(&self, owner: &str, query: &ModelQuery) -> Result<Vec<Model>, StoreError> {
        let sql = format!(
            "SELECT {} FROM models
             WHERE owner = ?1 AND deleted_at IS NULL AND (?2 IS NULL OR model_type = ?2)
             ORDER BY id LIMIT ?3 OFFSET ?4",
            MODEL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                owner,
                query.model_type.map(|t| t.as_str()),
                query.limit.max(0),
                query.skip.max(0)
            ],
            ModelRow::from_row,
        )?;
        let mut models = Vec::new();
        for row in rows {
            models.push(row?.into_model()?);
        }
        Ok(models)
    }

    pub fn update_model(
        &self,
        owner: &str,
        id: i64,
        update: &ModelUpdate,
    ) -> Result<Model, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let model = Self::owned_model(&tx, owner, id)?;

        if let Some(name) = &update.name
            && name != &model.name
        {
            tx.execute(
                "UPDATE models SET name = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![name, id],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateName { name: name.clone() }
                } else {
                    StoreError::Database(e)
                }
            })?;
        }
        if let Some(description) = &update.description {
            tx.execute(
                "UPDATE models SET description = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![description, id],
            )?;
        }
        if let Some(is_public) = update.is_public {
            tx.execute(
                "UPDATE models SET is_public = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![is_public, id],
            )?;
        }

        tx.commit()?;
        Self::fetch_model(&self.conn, id)?.ok_or(StoreError::ModelNotFound { id })
    }

    /// Soft delete when versions exist (history is never destroyed), hard
    /// delete otherwise. Either way the name becomes free again.
    pub fn delete_model(&self, owner: &str, id: i64) -> Result<DeleteOutcome, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        Self::owned_model(&tx, owner, id)?;
        let versions: i64 = tx.query_row(
            "SELECT COUNT(*) FROM versions WHERE model_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let outcome = if versions > 0 {
            tx.execute(
                "UPDATE models SET deleted_at = datetime('now'), updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )?;
            DeleteOutcome::SoftDeleted
        } else {
            tx.execute("DELETE FROM models WHERE id = ?1", params![id])?;
            DeleteOutcome::Deleted
        };
        tx.commit()?;
        Ok(outcome)
    }

    // ── Versions ──────────────────────────────────────────────────────

    fn latest_seq(conn: &Connection, model_id: i64) -> Result<i64, StoreError> {
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM versions WHERE model_id = ?1",
            params![model_id],
            |row| row.get(0),
        )?)
    }

    /// Append the next version and move the current pointer. Must run
    /// inside a transaction.
    fn insert_version(conn: &Connection, model_id: i64, new: &NewVersion) -> Result<i64, StoreError> {
        if !new.result.is_success() {
            return Err(StoreError::NotCommittable {
                status: new.result.status.to_string(),
            });
        }

        let actual = Self::latest_seq(conn, model_id)?;
        if let Some(expected) = new.expected_current
            && expected != actual
        {
            return Err(StoreError::VersionConflict {
                model_id,
                expected,
                actual,
            });
        }

        let seq = actual + 1;
        conn.execute(
            "INSERT INTO versions
             (model_id, seq, code, parameters, inputs, result, status, conversation_id, prompt_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                model_id,
                seq,
                new.code,
                to_json(&new.parameters)?,
                to_json(&new.inputs)?,
                to_json(&new.result)?,
                new.result.status.as_str(),
                new.provenance.conversation_id.map(|id| id.to_string()),
                new.provenance.prompt_hash,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::VersionConflict {
                    model_id,
                    expected: actual,
                    actual: seq,
                }
            } else {
                StoreError::Database(e)
            }
        })?;
        conn.execute(
            "UPDATE models SET current_version = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![seq, model_id],
        )?;
        Ok(seq)
    }

    fn fetch_version(conn: &Connection, model_id: i64, seq: i64) -> Result<Version, StoreError> {
        let sql = format!(
            "SELECT {} FROM versions WHERE model_id = ?1 AND seq = ?2",
            VERSION_COLUMNS
        );
        conn.query_row(&sql, params![model_id, seq], VersionRow::from_row)
            .optional()?
            .ok_or(StoreError::VersionNotFound { model_id, seq })?
            .into_version()
    }

    /// Commit a successful execution as the model's next version.
    pub fn commit_version(
        &self,
        owner: &str,
        model_id: i64,
        new: &NewVersion,
    ) -> Result<Version, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        Self::owned_model(&tx, owner, model_id)?;
        let seq = Self::insert_version(&tx, model_id, new)?;
        tx.commit()?;
        tracing::info!(model_id, seq, "Committed version");
        Self::fetch_version(&self.conn, model_id, seq)
    }

    /// Find the owner's model by name (creating it if needed) and commit in
    /// one transaction. A model created here never exists without a version.
    pub fn commit_generation(
        &self,
        model: &NewModel,
        new: &NewVersion,
    ) -> Result<(Model, Version, bool), StoreError> {
        if !new.result.is_success() {
            return Err(StoreError::NotCommittable {
                status: new.result.status.to_string(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM models WHERE owner = ?1 AND name = ?2 AND deleted_at IS NULL",
                params![model.owner, model.name],
                |row| row.get(0),
            )
            .optional()?;
        let (model_id, created) = match existing {
            Some(id) => (id, false),
            None => (Self::insert_model(&tx, model)?, true),
        };
        let seq = Self::insert_version(&tx, model_id, new)?;
        tx.commit()?;
        tracing::info!(model_id, seq, created, "Committed generated version");

        let stored = Self::fetch_model(&self.conn, model_id)?
            .ok_or(StoreError::ModelNotFound { id: model_id })?;
        let version = Self::fetch_version(&self.conn, model_id, seq)?;
        Ok((stored, version, created))
    }

    /// Create a model whose first version is committed in the same
    /// transaction. Unlike `commit_generation` an existing name is an error.
    pub fn create_model_with_version(
        &self,
        model: &NewModel,
        new: &NewVersion,
    ) -> Result<(Model, Version), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let model_id = Self::insert_model(&tx, model)?;
        let seq = Self::insert_version(&tx, model_id, new)?;
        tx.commit()?;

        let stored = Self::fetch_model(&self.conn, model_id)?
            .ok_or(StoreError::ModelNotFound { id: model_id })?;
        let version = Self::fetch_version(&self.conn, model_id, seq)?;
        Ok((stored, version))
    }

    pub fn get_version(&self, owner: &str, model_id: i64, seq: i64) -> Result<Version, StoreError> {
        self.get_model(owner, model_id)?;
        Self::fetch_version(&self.conn, model_id, seq)
    }

    pub fn list_versions(&self, owner: &str, model_id: i64) -> Result<Vec<Version>, StoreError> {
        self.get_model(owner, model_id)?;
        let sql = format!(
            "SELECT {} FROM versions WHERE model_id = ?1 ORDER BY seq",
            VERSION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![model_id], VersionRow::from_row)?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?.into_version()?);
        }
        Ok(versions)
    }

    // ── Data sources ──────────────────────────────────────────────────

    pub fn create_data_source(
        &self,
        owner: &str,
        name: &str,
        description: &str,
        table: &DataTable,
    ) -> Result<DataSource, StoreError> {
        self.conn.execute(
            "INSERT INTO data_sources (owner, name, description, columns, rows)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                owner,
                name,
                description,
                to_json(&table.columns)?,
                to_json(&table.rows)?
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_data_source(owner, id)
    }

    pub fn list_data_sources(&self, owner: &str) -> Result<Vec<DataSourceSummary>, StoreError> {
        let sql = format!(
            "SELECT {} FROM data_sources WHERE owner = ?1 ORDER BY id",
            DATA_SOURCE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner], DataSourceRow::from_row)?;
        let mut sources = Vec::new();
        for row in rows {
            let source = row?.into_data_source()?;
            sources.push(DataSourceSummary::from(&source));
        }
        Ok(sources)
    }

    pub fn get_data_source(&self, owner: &str, id: i64) -> Result<DataSource, StoreError> {
        let sql = format!("SELECT {} FROM data_sources WHERE id = ?1", DATA_SOURCE_COLUMNS);
        let source = self
            .conn
            .query_row(&sql, params![id], DataSourceRow::from_row)
            .optional()?
            .ok_or(StoreError::DataSourceNotFound { id })?
            .into_data_source()?;
        if source.owner != owner {
            return Err(StoreError::Forbidden);
        }
        Ok(source)
    }

    pub fn update_data_source(
        &self,
        owner: &str,
        id: i64,
        update: &DataSourceUpdate,
    ) -> Result<DataSource, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let sql = format!("SELECT {} FROM data_sources WHERE id = ?1", DATA_SOURCE_COLUMNS);
            let current = tx
                .query_row(&sql, params![id], DataSourceRow::from_row)
                .optional()?
                .ok_or(StoreError::DataSourceNotFound { id })?
                .into_data_source()?;
            if current.owner != owner {
                return Err(StoreError::Forbidden);
            }
        }
        if let Some(name) = &update.name {
            tx.execute(
                "UPDATE data_sources SET name = ?1 WHERE id = ?2",
                params![name, id],
            )?;
        }
        if let Some(description) = &update.description {
            tx.execute(
                "UPDATE data_sources SET description = ?1 WHERE id = ?2",
                params![description, id],
            )?;
        }
        if let Some(table) = &update.table {
            tx.execute(
                "UPDATE data_sources SET columns = ?1, rows = ?2 WHERE id = ?3",
                params![to_json(&table.columns)?, to_json(&table.rows)?, id],
            )?;
        }
        tx.commit()?;
        self.get_data_source(owner, id)
    }

    pub fn delete_data_source(&self, owner: &str, id: i64) -> Result<(), StoreError> {
        self.get_data_source(owner, id)?;
        self.conn
            .execute("DELETE FROM data_sources WHERE id = ?1", params![id])?;
        Ok(())
    }
}
