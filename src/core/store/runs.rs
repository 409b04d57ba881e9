use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{NewRun, RunCounters, RunEventRecord, RunRecord, TurnRecord};
use super::{Store, now_ms};

const RUN_COLUMNS: &str = "run_id, version_id, status, input_json, trigger_id, trigger_json, final_output,
    error_kind, error_message, turns, input_tokens, output_tokens, tokens_estimated, cost_usd,
    elapsed_ms, cancel_requested, created_at, updated_at, started_at, finished_at";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_id: row.get(0)?,
        version_id: row.get(1)?,
        status: row.get(2)?,
        input_json: row.get(3)?,
        trigger_id: row.get(4)?,
        trigger_json: row.get(5)?,
        final_output: row.get(6)?,
        error_kind: row.get(7)?,
        error_message: row.get(8)?,
        counters: RunCounters {
            turns: row.get(9)?,
            input_tokens: row.get::<_, i64>(10)? as u64,
            output_tokens: row.get::<_, i64>(11)? as u64,
            tokens_estimated: row.get(12)?,
            cost_usd: row.get(13)?,
            elapsed_ms: row.get::<_, i64>(14)? as u64,
        },
        cancel_requested: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
        started_at: row.get(18)?,
        finished_at: row.get(19)?,
    })
}

impl Store {
    /// Insert the run and its job atomically so an accepted run is always executable.
    pub async fn create_run_with_job(
        &self,
        run: &NewRun,
        job_id: &str,
        max_attempts: u32,
    ) -> Result<()> {
        let mut db = self.db.lock().await;
        let now = now_ms();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO agent_runs (run_id, version_id, status, input_json, trigger_id, trigger_json, created_at, updated_at)
             VALUES (?1, ?2, 'queued', ?3, ?4, ?5, ?6, ?6)",
            params![
                run.run_id,
                run.version_id,
                run.input_json,
                run.trigger_id,
                run.trigger_json,
                now
            ],
        )?;
        tx.execute(
            "INSERT INTO jobs (job_id, run_id, state, attempts, max_attempts, available_at, created_at, updated_at)
             VALUES (?1, ?2, 'queued', 0, ?3, ?4, ?4, ?4)",
            params![job_id, run.run_id, max_attempts, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                &format!("SELECT {} FROM agent_runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM agent_runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], run_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Move a run to `running`. Returns false when the run is already terminal.
    pub async fn mark_run_running(&self, run_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let now = now_ms();
        let rows = db.execute(
            "UPDATE agent_runs SET status = 'running', started_at = COALESCE(started_at, ?2), updated_at = ?2
             WHERE run_id = ?1 AND status IN ('queued', 'running')",
            params![run_id, now],
        )?;
        Ok(rows > 0)
    }

    /// Persist one completed round together with the counters it produced.
    pub async fn save_turn(
        &self,
        run_id: &str,
        turn_index: u32,
        turn_json: &str,
        counters: &RunCounters,
    ) -> Result<()> {
        let mut db = self.db.lock().await;
        let now = now_ms();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO run_turns (run_id, turn_index, turn_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, turn_index, turn_json, now],
        )?;
        update_counters(&tx, run_id, counters, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Record the terminal state. Returns false if the run had already reached one.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: &str,
        final_output: Option<&str>,
        error_kind: Option<&str>,
        error_message: Option<&str>,
        counters: &RunCounters,
    ) -> Result<bool> {
        let mut db = self.db.lock().await;
        let now = now_ms();
        let tx = db.transaction()?;
        update_counters(&tx, run_id, counters, now)?;
        let rows = tx.execute(
            "UPDATE agent_runs SET status = ?2, final_output = ?3, error_kind = ?4, error_message = ?5,
                 finished_at = ?6, updated_at = ?6
             WHERE run_id = ?1 AND status IN ('queued', 'running')",
            params![run_id, status, final_output, error_kind, error_message, now],
        )?;
        tx.commit()?;
        Ok(rows > 0)
    }

    /// Flag the run for cancellation and return its status at the time of the request.
    pub async fn request_cancel(&self, run_id: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE agent_runs SET cancel_requested = 1, updated_at = ?2
             WHERE run_id = ?1 AND status IN ('queued', 'running')",
            params![run_id, now_ms()],
        )?;
        let status = db
            .query_row(
                "SELECT status FROM agent_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(status)
    }

    pub async fn is_cancel_requested(&self, run_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let flag = db
            .query_row(
                "SELECT cancel_requested FROM agent_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(false))
    }

    /// Cancel a run whose job no worker has claimed yet. Returns true when that happened.
    pub async fn cancel_unclaimed_run(&self, run_id: &str) -> Result<bool> {
        let mut db = self.db.lock().await;
        let now = now_ms();
        let tx = db.transaction()?;
        let rows = tx.execute(
            "UPDATE jobs SET state = 'failed', last_error = 'cancelled before start', error_class = 'validation',
                 updated_at = ?2
             WHERE run_id = ?1 AND state IN ('queued', 'retrying')",
            params![run_id, now],
        )?;
        if rows > 0 {
            tx.execute(
                "UPDATE agent_runs SET status = 'cancelled', error_kind = 'cancelled',
                     error_message = 'cancelled before start', finished_at = ?2, updated_at = ?2
                 WHERE run_id = ?1 AND status IN ('queued', 'running')",
                params![run_id, now],
            )?;
        }
        tx.commit()?;
        Ok(rows > 0)
    }

    pub async fn list_turns(&self, run_id: &str) -> Result<Vec<TurnRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT run_id, turn_index, turn_json, created_at FROM run_turns
             WHERE run_id = ?1 ORDER BY turn_index ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(TurnRecord {
                run_id: row.get(0)?,
                turn_index: row.get(1)?,
                turn_json: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn list_active_runs_for_trigger(&self, trigger_id: &str) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT run_id FROM agent_runs WHERE trigger_id = ?1 AND status IN ('queued', 'running')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![trigger_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn append_run_event(
        &self,
        run_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO run_events (run_id, event_type, payload_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, event_type, payload.to_string(), now_ms()],
        )?;
        Ok(())
    }

    pub async fn list_run_events(&self, run_id: &str) -> Result<Vec<RunEventRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, run_id, event_type, payload_json, created_at FROM run_events
             WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, run_id, event_type, payload_json, created_at) = row?;
            out.push(RunEventRecord {
                id,
                run_id,
                event_type,
                payload: serde_json::from_str(&payload_json)?,
                created_at,
            });
        }
        Ok(out)
    }
}

fn update_counters(
    db: &rusqlite::Connection,
    run_id: &str,
    counters: &RunCounters,
    now: i64,
) -> rusqlite::Result<usize> {
    db.execute(
        "UPDATE agent_runs SET turns = ?2, input_tokens = ?3, output_tokens = ?4, tokens_estimated = ?5,
             cost_usd = ?6, elapsed_ms = ?7, updated_at = ?8
         WHERE run_id = ?1",
        params![
            run_id,
            counters.turns,
            counters.input_tokens as i64,
            counters.output_tokens as i64,
            counters.tokens_estimated,
            counters.cost_usd,
            counters.elapsed_ms as i64,
            now
        ],
    )
}
