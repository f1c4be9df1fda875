use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{RunStore, StoreResult};
use crate::core::agent::{Agent, Trigger};

type AgentRow = (String, String, String, String, String, Option<DateTime<Utc>>);

fn agent_row(row: &Row<'_>) -> rusqlite::Result<AgentRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode(row: AgentRow) -> StoreResult<Agent> {
    let (name, model, prompt, tools, triggers, next_run) = row;
    Ok(Agent {
        name,
        model,
        prompt,
        tools: serde_json::from_str::<Vec<String>>(&tools)?,
        triggers: serde_json::from_str::<Vec<Trigger>>(&triggers)?,
        next_run,
    })
}

impl RunStore {
    /// Insert or replace an agent definition. The stored `next_run` is left
    /// alone; only the scheduler writes it.
    pub async fn upsert_agent(&self, agent: &Agent) -> StoreResult<()> {
        let tools = serde_json::to_string(&agent.tools)?;
        let triggers = serde_json::to_string(&agent.triggers)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agents (name, model, prompt, tools, triggers) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                model = excluded.model,
                prompt = excluded.prompt,
                tools = excluded.tools,
                triggers = excluded.triggers,
                updated_at = CURRENT_TIMESTAMP",
            params![agent.name, agent.model, agent.prompt, tools, triggers],
        )?;
        Ok(())
    }

    pub async fn get_agent(&self, name: &str) -> StoreResult<Option<Agent>> {
        let row = {
            let db = self.db.lock().await;
            db.query_row(
                "SELECT name, model, prompt, tools, triggers, next_run FROM agents WHERE name = ?1",
                params![name],
                agent_row,
            )
            .optional()?
        };
        row.map(decode).transpose()
    }

    pub async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        let rows = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(
                "SELECT name, model, prompt, tools, triggers, next_run FROM agents ORDER BY name",
            )?;
            let mut rows = Vec::new();
            for row in stmt.query_map([], agent_row)? {
                rows.push(row?);
            }
            rows
        };
        rows.into_iter().map(decode).collect()
    }

    pub async fn delete_agent(&self, name: &str) -> StoreResult<bool> {
        let db = self.db.lock().await;
        let deleted = db.execute("DELETE FROM agents WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    }

    pub async fn set_agent_next_run(
        &self,
        name: &str,
        next_run: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE agents SET next_run = ?1 WHERE name = ?2",
            params![next_run, name],
        )?;
        Ok(())
    }
}
