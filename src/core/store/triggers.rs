use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{FireRecord, TriggerRecord};
use super::{Store, now_ms};

fn trigger_from_row(row: &Row<'_>) -> rusqlite::Result<TriggerRecord> {
    Ok(TriggerRecord {
        trigger_id: row.get(0)?,
        name: row.get(1)?,
        kind_json: row.get(2)?,
        version_id: row.get(3)?,
        overlap: row.get(4)?,
        input_json: row.get(5)?,
        enabled: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl Store {
    pub async fn upsert_trigger(&self, rec: &TriggerRecord) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO triggers (trigger_id, name, kind_json, version_id, overlap, input_json, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rec.trigger_id,
                rec.name,
                rec.kind_json,
                rec.version_id,
                rec.overlap,
                rec.input_json,
                rec.enabled,
                rec.created_at
            ],
        )?;
        Ok(())
    }

    pub async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                "SELECT trigger_id, name, kind_json, version_id, overlap, input_json, enabled, created_at
                 FROM triggers WHERE trigger_id = ?1",
                params![trigger_id],
                trigger_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn list_triggers(&self) -> Result<Vec<TriggerRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT trigger_id, name, kind_json, version_id, overlap, input_json, enabled, created_at
             FROM triggers ORDER BY created_at ASC, name ASC",
        )?;
        let rows = stmt.query_map([], trigger_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn delete_trigger(&self, trigger_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM triggers WHERE trigger_id = ?1",
            params![trigger_id],
        )?;
        Ok(rows > 0)
    }

    pub async fn record_fire(
        &self,
        trigger_id: &str,
        run_id: Option<&str>,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<FireRecord> {
        let db = self.db.lock().await;
        let fired_at = now_ms();
        db.execute(
            "INSERT INTO trigger_fires (trigger_id, run_id, outcome, detail, fired_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![trigger_id, run_id, outcome, detail, fired_at],
        )?;
        Ok(FireRecord {
            id: db.last_insert_rowid(),
            trigger_id: trigger_id.to_string(),
            run_id: run_id.map(str::to_string),
            outcome: outcome.to_string(),
            detail: detail.map(str::to_string),
            fired_at,
        })
    }

    pub async fn list_fires(&self, trigger_id: &str) -> Result<Vec<FireRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, trigger_id, run_id, outcome, detail, fired_at FROM trigger_fires
             WHERE trigger_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![trigger_id], |row| {
            Ok(FireRecord {
                id: row.get(0)?,
                trigger_id: row.get(1)?,
                run_id: row.get(2)?,
                outcome: row.get(3)?,
                detail: row.get(4)?,
                fired_at: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
