mod jobs;
mod runs;
mod triggers;
pub mod types;
mod versions;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

pub use jobs::ClaimOutcome;
pub use types::{
    FireRecord, JobRecord, NewRun, RunCounters, RunEventRecord, RunRecord, TriggerRecord,
    TurnRecord, VersionRecord,
};

/// Milliseconds since the Unix epoch. All persisted timestamps use this unit.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Durable storage for versions, runs, transcripts, jobs and triggers.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Connection::open(path)?;
        db.busy_timeout(Duration::from_secs(5))?;
        db.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
        info!("Opened store at {:?}", path);
        Self::bootstrap(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(db: Connection) -> Result<Self> {
        db.pragma_update(None, "foreign_keys", "ON")?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS agent_versions (
                version_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                config_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_versions_agent ON agent_versions(agent_id, created_at)",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS agent_runs (
                run_id TEXT PRIMARY KEY,
                version_id TEXT NOT NULL REFERENCES agent_versions(version_id),
                status TEXT NOT NULL,
                input_json TEXT NOT NULL,
                trigger_id TEXT,
                trigger_json TEXT,
                final_output TEXT,
                error_kind TEXT,
                error_message TEXT,
                turns INTEGER NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                tokens_estimated INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                elapsed_ms INTEGER NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_runs_trigger ON agent_runs(trigger_id, status)",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS run_turns (
                run_id TEXT NOT NULL REFERENCES agent_runs(run_id),
                turn_index INTEGER NOT NULL,
                turn_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (run_id, turn_index)
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS run_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES agent_runs(run_id),
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                visible_until INTEGER,
                worker_id TEXT,
                last_error TEXT,
                error_class TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, available_at)",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS triggers (
                trigger_id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                kind_json TEXT NOT NULL,
                version_id TEXT NOT NULL,
                overlap TEXT NOT NULL,
                input_json TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS trigger_fires (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trigger_id TEXT NOT NULL,
                run_id TEXT,
                outcome TEXT NOT NULL,
                detail TEXT,
                fired_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}
