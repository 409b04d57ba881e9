use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};

use super::Store;
use super::types::VersionRecord;

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<VersionRecord> {
    Ok(VersionRecord {
        version_id: row.get(0)?,
        agent_id: row.get(1)?,
        config_json: row.get(2)?,
        created_at: row.get(3)?,
    })
}

impl Store {
    pub async fn insert_version(
        &self,
        version_id: &str,
        agent_id: &str,
        config_json: &str,
        created_at: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        // Plain INSERT: a version id is never rewritten.
        db.execute(
            "INSERT INTO agent_versions (version_id, agent_id, config_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![version_id, agent_id, config_json, created_at],
        )?;
        Ok(())
    }

    pub async fn get_version(&self, version_id: &str) -> Result<Option<VersionRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                "SELECT version_id, agent_id, config_json, created_at FROM agent_versions WHERE version_id = ?1",
                params![version_id],
                version_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn list_versions_for_agent(&self, agent_id: &str) -> Result<Vec<VersionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT version_id, agent_id, config_json, created_at FROM agent_versions
             WHERE agent_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![agent_id], version_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn latest_version_for_agent(&self, agent_id: &str) -> Result<Option<VersionRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                "SELECT version_id, agent_id, config_json, created_at FROM agent_versions
                 WHERE agent_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![agent_id],
                version_from_row,
            )
            .optional()?;
        Ok(rec)
    }
}
