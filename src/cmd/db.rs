//! Database initialization command: `modelsmith init-db`.

use anyhow::{Context, Result};
use modelsmith::config::AppConfig;
use modelsmith::store::ModelDb;

pub fn cmd_init_db(config: &AppConfig) -> Result<()> {
    let db_path = &config.store.db_path;
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    ModelDb::new(db_path)
        .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;
    println!("Model database initialized at {}", db_path.display());
    Ok(())
}
