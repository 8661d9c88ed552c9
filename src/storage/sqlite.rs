use super::{CollectionRound, Storage, StorageError, StorageStats};
use crate::collectors::{Fields, Metric, MetricKind, Tags};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct SqliteStorage {
    db_path: PathBuf,
}

impl SqliteStorage {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_db_directory(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn get_connection(&self) -> SqliteResult<Connection> {
        Connection::open(&self.db_path)
    }

    fn create_tables(&self) -> Result<(), StorageError> {
        let conn = self.get_connection()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS collection_rounds (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                metrics_count INTEGER NOT NULL
            )",
            [],
        )?;

        // tags and fields are JSON objects keyed by name
        conn.execute(
            "CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection_round_id TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                tags TEXT NOT NULL,
                fields TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                FOREIGN KEY(collection_round_id) REFERENCES collection_rounds(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_metrics_collection_round
             ON metrics(collection_round_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_metrics_name_timestamp
             ON metrics(name, timestamp DESC)",
            [],
        )?;

        Ok(())
    }

    /// Most recent metrics named `name`, newest first.
    pub fn query_latest(&self, name: &str, limit: usize) -> Result<Vec<Metric>, StorageError> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT name, kind, tags, fields, timestamp
             FROM metrics
             WHERE name = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![name, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut metrics = Vec::new();
        for row in rows {
            let (name, kind, tags, fields, timestamp) = row?;
            let tags: Tags = serde_json::from_str(&tags)?;
            let fields: Fields = serde_json::from_str(&fields)?;
            let kind: MetricKind = serde_json::from_value(serde_json::Value::String(kind))?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| StorageError::Corrupt(format!("timestamp {timestamp:?}: {e}")))?
                .with_timezone(&Utc);

            let metric = Metric::new(name, tags, fields, timestamp)
                .map_err(|e| StorageError::Corrupt(e.to_string()))?;
            metrics.push(metric.with_kind(kind));
        }
        Ok(metrics)
    }
}

fn kind_name(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Untyped => "untyped",
        MetricKind::Gauge => "gauge",
        MetricKind::Counter => "counter",
    }
}

impl Storage for SqliteStorage {
    fn initialize(&self) -> Result<(), StorageError> {
        self.ensure_db_directory()?;
        self.create_tables()?;
        Ok(())
    }

    fn store_metrics(&self, metrics: Vec<Metric>) -> Result<CollectionRound, StorageError> {
        if metrics.is_empty() {
            return Err(StorageError::Empty);
        }

        let conn = self.get_connection()?;
        let collection_id = Uuid::new_v4().to_string();
        let collection_timestamp = Utc::now();
        let metrics_count = metrics.len();

        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO collection_rounds (id, timestamp, metrics_count) VALUES (?1, ?2, ?3)",
            params![
                collection_id,
                collection_timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                metrics_count
            ],
        )?;

        for metric in &metrics {
            tx.execute(
                "INSERT INTO metrics (collection_round_id, name, kind, tags, fields, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    collection_id,
                    metric.name(),
                    kind_name(metric.kind()),
                    serde_json::to_string(metric.tags())?,
                    serde_json::to_string(metric.fields())?,
                    // fixed width keeps lexical order equal to time order
                    metric.timestamp().to_rfc3339_opts(SecondsFormat::Nanos, true)
                ],
            )?;
        }

        tx.commit()?;

        Ok(CollectionRound {
            id: collection_id,
            timestamp: collection_timestamp,
            metrics_count,
        })
    }

    fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.get_connection()?;

        let total_metrics: i64 = conn.query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?;

        let total_collection_rounds: i64 =
            conn.query_row("SELECT COUNT(*) FROM collection_rounds", [], |row| row.get(0))?;

        let latest_collection = conn
            .query_row(
                "SELECT id, timestamp, metrics_count FROM collection_rounds
                 ORDER BY timestamp DESC LIMIT 1",
                [],
                |row| {
                    let id: String = row.get(0)?;
                    let timestamp_str: String = row.get(1)?;
                    let metrics_count: usize = row.get::<_, i64>(2)? as usize;

                    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                        .map_err(|_e| {
                            rusqlite::Error::InvalidColumnType(
                                1,
                                "timestamp".to_string(),
                                rusqlite::types::Type::Text,
                            )
                        })?
                        .with_timezone(&Utc);

                    Ok(CollectionRound {
                        id,
                        timestamp,
                        metrics_count,
                    })
                },
            )
            .optional()?;

        let database_size_bytes = fs::metadata(&self.db_path).map(|metadata| metadata.len()).ok();

        Ok(StorageStats {
            total_metrics,
            total_collection_rounds,
            latest_collection,
            database_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::FieldValue;
    use chrono::TimeZone;

    fn metric(program: &str, pid: i64, secs: i64) -> Metric {
        let mut tags = Tags::new();
        tags.insert("program".to_string(), program.to_string());
        let mut fields = Fields::new();
        fields.insert("pid".to_string(), pid.into());
        fields.insert("statename".to_string(), "RUNNING".into());
        fields.insert("cpu".to_string(), 0.25.into());
        Metric::new("supervisor", tags, fields, Utc.timestamp_opt(secs, 0).unwrap()).unwrap()
    }

    #[test]
    fn test_storage_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::new(dir.path().join("nested").join("metrics.db"));
        storage.initialize().unwrap();

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.total_metrics, 0);
        assert_eq!(stats.total_collection_rounds, 0);
        assert!(stats.latest_collection.is_none());
        assert!(stats.database_size_bytes.is_some());
    }

    #[test]
    fn test_store_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::new(dir.path().join("metrics.db"));
        storage.initialize().unwrap();

        let round = storage
            .store_metrics(vec![
                metric("worker-a", 111, 1_000),
                metric("worker-b", 222, 2_000).with_kind(MetricKind::Gauge),
            ])
            .unwrap();
        assert_eq!(round.metrics_count, 2);

        let latest = storage.query_latest("supervisor", 10).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0], metric("worker-b", 222, 2_000).with_kind(MetricKind::Gauge));
        assert_eq!(latest[1].field("pid"), Some(&FieldValue::Integer(111)));
        assert_eq!(latest[1].field("cpu"), Some(&FieldValue::Float(0.25)));

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.total_metrics, 2);
        assert_eq!(stats.total_collection_rounds, 1);
        assert_eq!(stats.latest_collection.unwrap().id, round.id);
    }

    #[test]
    fn test_latest_round_within_one_second() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::new(dir.path().join("metrics.db"));
        storage.initialize().unwrap();

        let mut last = None;
        for i in 0..20 {
            let round = storage.store_metrics(vec![metric("worker-a", i, 1_000)]).unwrap();
            last = Some(round.id);
        }

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.total_collection_rounds, 20);
        assert_eq!(stats.latest_collection.unwrap().id, last.unwrap());

        // stored round timestamps share one width
        let conn = Connection::open(storage.path()).unwrap();
        let widths: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT length(timestamp)) FROM collection_rounds",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(widths, 1);
    }

    #[test]
    fn test_empty_round_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::new(dir.path().join("metrics.db"));
        storage.initialize().unwrap();
        assert!(matches!(storage.store_metrics(Vec::new()), Err(StorageError::Empty)));
    }
}
