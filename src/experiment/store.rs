//! Experiment store
//!
//! Persists experiment records and batched traces. The sqlite variant backs
//! the `db` trace sink and the experiment daemon's status writes; the
//! in-memory variant backs tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::Result;
use crate::experiment::model::{Experiment, ExperimentStatus};
use crate::worker::RequestTrace;

/// Persistence for experiments and traces.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn save_experiment(&self, experiment: &Experiment) -> Result<()>;

    async fn find_experiment(&self, id: &str) -> Result<Option<Experiment>>;

    async fn save_traces(&self, traces: &[RequestTrace]) -> Result<()>;
}

/// SQLite-backed store.
pub struct SqliteExperimentStore {
    pool: SqlitePool,
}

impl SqliteExperimentStore {
    /// Opens (and creates if needed) the database at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        let url = format!("sqlite:{path}?mode=rwc");
        let pool = SqlitePoolOptions::new().connect(&url).await?;
        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS experiments (
                id TEXT PRIMARY KEY,
                name TEXT,
                creator TEXT,
                created REAL,
                start REAL,
                end_time REAL,
                status TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS traces (
                request_id TEXT NOT NULL,
                client TEXT NOT NULL,
                service TEXT NOT NULL,
                server TEXT NOT NULL,
                created REAL NOT NULL,
                sent REAL NOT NULL,
                done REAL NOT NULL,
                status INTEGER NOT NULL,
                response TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn status_from_str(raw: &str) -> ExperimentStatus {
    match raw {
        "IN_PROGRESS" => ExperimentStatus::InProgress,
        "FINISHED" => ExperimentStatus::Finished,
        "FAILED" => ExperimentStatus::Failed,
        _ => ExperimentStatus::Queued,
    }
}

#[async_trait]
impl ExperimentStore for SqliteExperimentStore {
    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO experiments (id, name, creator, created, start, end_time, status)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(experiment.id.as_deref().unwrap_or_default())
        .bind(&experiment.name)
        .bind(&experiment.creator)
        .bind(experiment.created)
        .bind(experiment.start)
        .bind(experiment.end)
        .bind(experiment.status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        let row = sqlx::query(
            "SELECT id, name, creator, created, start, end_time, status
             FROM experiments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Experiment {
            id: row.get("id"),
            name: row.get("name"),
            creator: row.get("creator"),
            created: row.get("created"),
            start: row.get("start"),
            end: row.get("end_time"),
            status: status_from_str(row.get::<String, _>("status").as_str()),
        }))
    }

    async fn save_traces(&self, traces: &[RequestTrace]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for trace in traces {
            sqlx::query(
                "INSERT INTO traces (request_id, client, service, server, created, sent, done, status, response)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&trace.request_id)
            .bind(&trace.client)
            .bind(&trace.service)
            .bind(&trace.server)
            .bind(trace.created)
            .bind(trace.sent)
            .bind(trace.done)
            .bind(trace.status)
            .bind(&trace.response)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Process-local store for tests.
#[derive(Default)]
pub struct InMemoryExperimentStore {
    experiments: Mutex<HashMap<String, Experiment>>,
    traces: Mutex<Vec<RequestTrace>>,
}

impl InMemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<RequestTrace> {
        self.traces.lock().expect("store lock poisoned").clone()
    }
}

#[async_trait]
impl ExperimentStore for InMemoryExperimentStore {
    async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        if let Some(id) = &experiment.id {
            self.experiments
                .lock()
                .expect("store lock poisoned")
                .insert(id.clone(), experiment.clone());
        }
        Ok(())
    }

    async fn find_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        Ok(self
            .experiments
            .lock()
            .expect("store lock poisoned")
            .get(id)
            .cloned())
    }

    async fn save_traces(&self, traces: &[RequestTrace]) -> Result<()> {
        self.traces
            .lock()
            .expect("store lock poisoned")
            .extend_from_slice(traces);
        Ok(())
    }
}

/// Trace writer flushing into an [`ExperimentStore`].
pub struct DatabaseTraceWriter<S> {
    store: std::sync::Arc<S>,
}

impl<S: ExperimentStore> DatabaseTraceWriter<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: ExperimentStore> crate::worker::TraceWriter for DatabaseTraceWriter<S> {
    async fn write(&self, traces: &[RequestTrace]) -> Result<()> {
        self.store.save_traces(traces).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> RequestTrace {
        RequestTrace {
            request_id: "p:0".to_string(),
            client: "w:svc:0".to_string(),
            service: "svc".to_string(),
            server: "h:80".to_string(),
            created: 1.0,
            sent: 1.1,
            done: 1.2,
            status: 200,
            response: None,
        }
    }

    #[tokio::test]
    async fn sqlite_store_roundtrips_experiment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("galileo.sqlite");
        let store = SqliteExperimentStore::open(path.to_str().unwrap())
            .await
            .unwrap();

        let mut experiment = Experiment {
            id: Some("exp-1".to_string()),
            name: Some("exp-1".to_string()),
            creator: Some("galileo".to_string()),
            created: Some(1000.0),
            ..Default::default()
        };
        store.save_experiment(&experiment).await.unwrap();

        experiment.transition(ExperimentStatus::InProgress).unwrap();
        experiment.start = Some(1001.0);
        store.save_experiment(&experiment).await.unwrap();

        let loaded = store.find_experiment("exp-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExperimentStatus::InProgress);
        assert_eq!(loaded.start, Some(1001.0));
        assert!(store.find_experiment("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_store_batch_inserts_traces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("galileo.sqlite");
        let store = SqliteExperimentStore::open(path.to_str().unwrap())
            .await
            .unwrap();

        store.save_traces(&[trace(), trace()]).await.unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM traces")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 2);
    }
}
