//! The run ledger: an append-only record of every processing run.
//!
//! Ledger I/O must never disrupt the pipeline. Every write swallows its
//! errors after logging them; a missing or broken database degrades to
//! "no ledger", not to failed runs. Rows become immutable once a terminal
//! status is written.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::{config::ProcessingLogsConfig, prelude::*, tokens::UsageTotals};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS processing_runs (
    run_id TEXT PRIMARY KEY,

    start_timestamp TEXT NOT NULL,
    end_timestamp TEXT,
    duration_seconds REAL,

    total_files INTEGER NOT NULL,
    successful_files INTEGER DEFAULT 0,
    failed_files INTEGER DEFAULT 0,

    schema_key TEXT NOT NULL,
    schema_name TEXT,
    model_id TEXT,
    instructions TEXT,

    input_tokens INTEGER DEFAULT 0,
    output_tokens INTEGER DEFAULT 0,
    total_tokens INTEGER DEFAULT 0,
    cache_read_tokens INTEGER DEFAULT 0,
    cache_write_tokens INTEGER DEFAULT 0,
    api_requests INTEGER DEFAULT 0,

    status TEXT DEFAULT 'running',

    created_at TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_runs_start_timestamp ON processing_runs(start_timestamp);
CREATE INDEX IF NOT EXISTS idx_runs_status ON processing_runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_schema_key ON processing_runs(schema_key);
CREATE INDEX IF NOT EXISTS idx_runs_created_at ON processing_runs(created_at);
";

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// The fields recorded when a run starts.
#[derive(Debug, Clone)]
pub struct RunStart {
    pub run_id: String,
    pub start_timestamp: DateTime<Utc>,
    pub total_files: usize,
    pub schema_key: String,
    pub schema_name: String,
    pub model_id: String,
    pub instructions: Option<String>,
}

/// The fields recorded when a run reaches a terminal state.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub run_id: String,
    pub end_timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub successful_files: usize,
    pub failed_files: usize,
    pub usage: UsageTotals,
    pub status: RunStatus,
}

/// SQLite-backed run ledger.
pub struct RunLedger {
    enabled: bool,
    db_path: PathBuf,
}

impl RunLedger {
    pub fn new(config: &ProcessingLogsConfig) -> Self {
        Self {
            enabled: config.enabled,
            db_path: config.path.clone(),
        }
    }

    /// Create the table and indexes. Errors are logged and swallowed like
    /// every other ledger operation.
    pub async fn start(self: &Arc<Self>) {
        if !self.enabled {
            return;
        }
        if let Err(err) = self
            .with_connection(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
        {
            error!(%err, "failed to initialize run ledger");
        }
    }

    /// Record a run start. A second start for the same `run_id` is a no-op.
    pub async fn insert_run_start(&self, record: RunStart) {
        if !self.enabled {
            return;
        }
        let result = self
            .with_connection(move |conn| {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO processing_runs (
                         run_id, start_timestamp, total_files,
                         schema_key, schema_name, model_id, instructions, status
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'running')",
                    params![
                        record.run_id,
                        record.start_timestamp.to_rfc3339(),
                        record.total_files as i64,
                        record.schema_key,
                        record.schema_name,
                        record.model_id,
                        record.instructions,
                    ],
                )?;
                if inserted == 0 {
                    debug!(run_id = %record.run_id, "run start already recorded");
                }
                Ok(())
            })
            .await;
        if let Err(err) = result {
            error!(%err, "error inserting run start");
        }
    }

    /// Record a run completion. A completion for an unknown `run_id` is
    /// logged and dropped.
    pub async fn update_run_complete(&self, completion: RunCompletion) {
        if !self.enabled {
            return;
        }
        let run_id = completion.run_id.clone();
        let result = self
            .with_connection(move |conn| {
                let updated = conn.execute(
                    "UPDATE processing_runs SET
                         end_timestamp = ?1,
                         duration_seconds = ?2,
                         successful_files = ?3,
                         failed_files = ?4,
                         input_tokens = ?5,
                         output_tokens = ?6,
                         total_tokens = ?7,
                         cache_read_tokens = ?8,
                         cache_write_tokens = ?9,
                         api_requests = ?10,
                         status = ?11
                     WHERE run_id = ?12 AND status = 'running'",
                    params![
                        completion.end_timestamp.to_rfc3339(),
                        completion.duration_seconds,
                        completion.successful_files as i64,
                        completion.failed_files as i64,
                        completion.usage.input_tokens as i64,
                        completion.usage.output_tokens as i64,
                        completion.usage.total_tokens as i64,
                        completion.usage.cache_read_tokens as i64,
                        completion.usage.cache_write_tokens as i64,
                        completion.usage.requests as i64,
                        completion.status.as_str(),
                        completion.run_id,
                    ],
                )?;
                Ok(updated)
            })
            .await;
        match result {
            Ok(0) => warn!(run_id = %run_id, "completion for unknown or finished run dropped"),
            Ok(_) => debug!(run_id = %run_id, "recorded run completion"),
            Err(err) => error!(%err, "error updating run completion"),
        }
    }

    /// Recent runs, newest first, optionally filtered by schema key.
    pub async fn recent_runs(
        &self,
        limit: usize,
        schema_key: Option<String>,
    ) -> Vec<Value> {
        if !self.enabled {
            return Vec::new();
        }
        let result = self
            .with_connection(move |conn| {
                let mut rows = Vec::new();
                let sql = match &schema_key {
                    Some(_) => {
                        "SELECT run_id, start_timestamp, end_timestamp, duration_seconds,
                                total_files, successful_files, failed_files,
                                schema_key, schema_name, model_id, total_tokens,
                                api_requests, status
                         FROM processing_runs WHERE schema_key = ?1
                         ORDER BY start_timestamp DESC LIMIT ?2"
                    }
                    None => {
                        "SELECT run_id, start_timestamp, end_timestamp, duration_seconds,
                                total_files, successful_files, failed_files,
                                schema_key, schema_name, model_id, total_tokens,
                                api_requests, status
                         FROM processing_runs
                         ORDER BY start_timestamp DESC LIMIT ?1"
                    }
                };
                let mut stmt = conn.prepare(sql)?;
                let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Value> {
                    Ok(json!({
                        "run_id": row.get::<_, String>(0)?,
                        "start_timestamp": row.get::<_, String>(1)?,
                        "end_timestamp": row.get::<_, Option<String>>(2)?,
                        "duration_seconds": row.get::<_, Option<f64>>(3)?,
                        "total_files": row.get::<_, i64>(4)?,
                        "successful_files": row.get::<_, i64>(5)?,
                        "failed_files": row.get::<_, i64>(6)?,
                        "schema_key": row.get::<_, String>(7)?,
                        "schema_name": row.get::<_, Option<String>>(8)?,
                        "model_id": row.get::<_, Option<String>>(9)?,
                        "total_tokens": row.get::<_, i64>(10)?,
                        "api_requests": row.get::<_, i64>(11)?,
                        "status": row.get::<_, String>(12)?,
                    }))
                };
                let mapped: Box<dyn Iterator<Item = rusqlite::Result<Value>>> =
                    match &schema_key {
                        Some(key) => Box::new(
                            stmt.query_map(params![key, limit as i64], map_row)?
                                .collect::<Vec<_>>()
                                .into_iter(),
                        ),
                        None => Box::new(
                            stmt.query_map(params![limit as i64], map_row)?
                                .collect::<Vec<_>>()
                                .into_iter(),
                        ),
                    };
                for row in mapped {
                    rows.push(row?);
                }
                Ok(rows)
            })
            .await;
        match result {
            Ok(rows) => rows,
            Err(err) => {
                error!(%err, "error reading recent runs");
                Vec::new()
            }
        }
    }

    /// Aggregate statistics over completed runs in the last `days` days.
    pub async fn stats(&self, days: u32) -> Value {
        if !self.enabled {
            return json!({});
        }
        let result = self
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT
                         COUNT(*),
                         COALESCE(SUM(total_files), 0),
                         COALESCE(SUM(successful_files), 0),
                         COALESCE(SUM(failed_files), 0),
                         COALESCE(SUM(total_tokens), 0),
                         COALESCE(AVG(duration_seconds), 0.0),
                         COALESCE(SUM(api_requests), 0)
                     FROM processing_runs
                     WHERE start_timestamp >= datetime('now', '-' || ?1 || ' days')
                       AND status = 'completed'",
                    params![days],
                    |row| {
                        Ok(json!({
                            "total_runs": row.get::<_, i64>(0)?,
                            "total_files_processed": row.get::<_, i64>(1)?,
                            "total_successful": row.get::<_, i64>(2)?,
                            "total_failed": row.get::<_, i64>(3)?,
                            "total_tokens": row.get::<_, i64>(4)?,
                            "avg_duration": row.get::<_, f64>(5)?,
                            "total_api_requests": row.get::<_, i64>(6)?,
                        }))
                    },
                )
                .map_err(Into::into)
            })
            .await;
        match result {
            Ok(stats) => stats,
            Err(err) => {
                error!(%err, "error reading ledger stats");
                json!({})
            }
        }
    }

    async fn with_connection<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            work(&conn)
        })
        .await
        .context("ledger task failed")?
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {parent:?}"))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open ledger db at {path:?}"))?;
    conn.busy_timeout(Duration::from_secs(30))?;
    let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA temp_store=MEMORY;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(dir: &Path) -> Arc<RunLedger> {
        Arc::new(RunLedger::new(&ProcessingLogsConfig {
            enabled: true,
            path: dir.join("logs.db"),
        }))
    }

    fn start_record(run_id: &str) -> RunStart {
        RunStart {
            run_id: run_id.to_string(),
            start_timestamp: Utc::now(),
            total_files: 3,
            schema_key: "invoice".to_string(),
            schema_name: "Invoice".to_string(),
            model_id: "gpt-4o".to_string(),
            instructions: None,
        }
    }

    fn completion_record(run_id: &str, status: RunStatus) -> RunCompletion {
        RunCompletion {
            run_id: run_id.to_string(),
            end_timestamp: Utc::now(),
            duration_seconds: 1.25,
            successful_files: 2,
            failed_files: 1,
            usage: UsageTotals::for_request(100, 30),
            status,
        }
    }

    #[tokio::test]
    async fn run_lifecycle_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path());
        ledger.start().await;

        ledger.insert_run_start(start_record("run-1")).await;
        ledger
            .update_run_complete(completion_record("run-1", RunStatus::Completed))
            .await;

        let runs = ledger.recent_runs(10, None).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["run_id"], "run-1");
        assert_eq!(runs[0]["status"], "completed");
        assert_eq!(runs[0]["successful_files"], 2);
        assert_eq!(runs[0]["total_tokens"], 130);
    }

    #[tokio::test]
    async fn duplicate_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path());
        ledger.insert_run_start(start_record("run-1")).await;
        let mut second = start_record("run-1");
        second.total_files = 99;
        ledger.insert_run_start(second).await;

        let runs = ledger.recent_runs(10, None).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["total_files"], 3);
    }

    #[tokio::test]
    async fn completion_for_unknown_run_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path());
        ledger
            .update_run_complete(completion_record("ghost", RunStatus::Completed))
            .await;
        assert!(ledger.recent_runs(10, None).await.is_empty());
    }

    #[tokio::test]
    async fn terminal_rows_are_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path());
        ledger.insert_run_start(start_record("run-1")).await;
        ledger
            .update_run_complete(completion_record("run-1", RunStatus::Completed))
            .await;
        // A second terminal write must not overwrite the first.
        let mut again = completion_record("run-1", RunStatus::Failed);
        again.successful_files = 0;
        ledger.update_run_complete(again).await;

        let runs = ledger.recent_runs(10, None).await;
        assert_eq!(runs[0]["status"], "completed");
        assert_eq!(runs[0]["successful_files"], 2);
    }

    #[tokio::test]
    async fn stats_cover_completed_runs() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(dir.path());
        ledger.insert_run_start(start_record("run-1")).await;
        ledger
            .update_run_complete(completion_record("run-1", RunStatus::Completed))
            .await;
        let stats = ledger.stats(30).await;
        assert_eq!(stats["total_runs"], 1);
        assert_eq!(stats["total_files_processed"], 3);
    }

    #[tokio::test]
    async fn disabled_ledger_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(RunLedger::new(&ProcessingLogsConfig {
            enabled: false,
            path: dir.path().join("logs.db"),
        }));
        ledger.insert_run_start(start_record("run-1")).await;
        assert!(ledger.recent_runs(10, None).await.is_empty());
        assert!(!dir.path().join("logs.db").exists());
    }
}
