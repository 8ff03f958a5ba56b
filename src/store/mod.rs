//! Model version store.
//!
//! Models, their immutable versions and owner-scoped data sources live in
//! SQLite. Every version is a successful execution; sequence numbers per
//! model are gapless and the model's current pointer always names the
//! highest one. Data sources can also be imported from CSV (`import`).

pub mod db;
pub mod import;
pub mod models;

pub use db::{DbHandle, ModelDb};
pub use models::*;

use async_trait::async_trait;

use crate::errors::StoreError;

/// Where execution inputs come from. The pipeline fetches every input
/// through this before execution; generated code never does.
#[async_trait]
pub trait SeriesSource: Send + Sync {
    async fn fetch_series(&self, owner: &str, source_id: i64) -> Result<DataSource, StoreError>;
}

#[async_trait]
impl SeriesSource for DbHandle {
    async fn fetch_series(&self, owner: &str, source_id: i64) -> Result<DataSource, StoreError> {
        let owner = owner.to_string();
        self.call(move |db| db.get_data_source(&owner, source_id))
            .await
    }
}
