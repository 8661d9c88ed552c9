use chrono::{DateTime, Utc};

use crate::collectors::Metric;

pub mod sqlite;

pub use sqlite::SqliteStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode metric: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored metric is corrupt: {0}")]
    Corrupt(String),

    #[error("cannot store an empty collection round")]
    Empty,
}

/// A batch of metrics written together.
#[derive(Debug, Clone)]
pub struct CollectionRound {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub metrics_count: usize,
}

#[derive(Debug, Clone)]
pub struct StorageStats {
    pub total_metrics: i64,
    pub total_collection_rounds: i64,
    pub latest_collection: Option<CollectionRound>,
    pub database_size_bytes: Option<u64>,
}

pub trait Storage: Send + Sync {
    fn initialize(&self) -> Result<(), StorageError>;
    fn store_metrics(&self, metrics: Vec<Metric>) -> Result<CollectionRound, StorageError>;
    fn get_stats(&self) -> Result<StorageStats, StorageError>;
}
