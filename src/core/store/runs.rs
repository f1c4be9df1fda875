use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::warn;

use super::cost::compute_cost;
use super::types::{Run, RunCompletion, RunStatus};
use super::{RunStore, StoreError, StoreResult};

const RUN_COLUMNS: &str = "id, agent_name, status, started_at, completed_at, duration_ms,
    input_tokens, output_tokens, cost, tool_calls, output, error";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        status: row.get(2)?,
        started_at: row.get::<_, DateTime<Utc>>(3)?,
        completed_at: row.get::<_, Option<DateTime<Utc>>>(4)?,
        duration_ms: row.get::<_, Option<i64>>(5)?.map(|d| d.max(0) as u64),
        input_tokens: row.get::<_, i64>(6)?.max(0) as u64,
        output_tokens: row.get::<_, i64>(7)?.max(0) as u64,
        cost: row.get(8)?,
        tool_calls: row.get(9)?,
        output: row.get(10)?,
        error: row.get(11)?,
    })
}

impl RunStore {
    /// Insert a new run in status `running` and return its id.
    pub async fn create_run(&self, agent_name: &str) -> StoreResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO runs (id, agent_name, status, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, agent_name, RunStatus::Running, Utc::now()],
        )?;
        Ok(id)
    }

    /// Terminal write for a successful run. Returns `false` when the run
    /// was already terminal; the earlier write is kept.
    pub async fn complete_run(&self, run_id: &str, completion: &RunCompletion) -> StoreResult<bool> {
        let cost = compute_cost(
            &completion.model,
            completion.input_tokens,
            completion.output_tokens,
        );
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2, duration_ms = ?3,
                input_tokens = ?4, output_tokens = ?5, cost = ?6, tool_calls = ?7, output = ?8
             WHERE id = ?9 AND status = ?10",
            params![
                RunStatus::Completed,
                Utc::now(),
                completion.duration_ms as i64,
                completion.input_tokens as i64,
                completion.output_tokens as i64,
                cost,
                completion.tool_calls,
                completion.output,
                run_id,
                RunStatus::Running,
            ],
        )?;
        if updated == 0 {
            warn!("Ignoring completion of run {}: not running", run_id);
        }
        Ok(updated > 0)
    }

    /// Terminal write for a failed run. Same single-write rule as
    /// [`RunStore::complete_run`].
    pub async fn fail_run(&self, run_id: &str, error: &str, duration_ms: u64) -> StoreResult<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2, duration_ms = ?3, error = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                RunStatus::Error,
                Utc::now(),
                duration_ms as i64,
                error,
                run_id,
                RunStatus::Running,
            ],
        )?;
        if updated == 0 {
            warn!("Ignoring failure of run {}: not running", run_id);
        }
        Ok(updated > 0)
    }

    /// Exact id first, then a unique id prefix.
    pub async fn get_run(&self, id_or_prefix: &str) -> StoreResult<Run> {
        let needle = id_or_prefix.trim();
        if needle.is_empty() {
            return Err(StoreError::RunNotFound(id_or_prefix.to_string()));
        }

        let db = self.db.lock().await;
        let exact = db
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![needle],
                run_from_row,
            )
            .optional()?;
        if let Some(run) = exact {
            return Ok(run);
        }

        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM runs WHERE substr(id, 1, length(?1)) = ?1 LIMIT 2",
            RUN_COLUMNS
        ))?;
        let mut matches = Vec::new();
        for row in stmt.query_map(params![needle], run_from_row)? {
            matches.push(row?);
        }
        match matches.len() {
            0 => Err(StoreError::RunNotFound(needle.to_string())),
            1 => Ok(matches.remove(0)),
            _ => {
                let count: i64 = db.query_row(
                    "SELECT COUNT(*) FROM runs WHERE substr(id, 1, length(?1)) = ?1",
                    params![needle],
                    |row| row.get(0),
                )?;
                Err(StoreError::AmbiguousRunId {
                    prefix: needle.to_string(),
                    matches: count as usize,
                })
            }
        }
    }

    /// Most recent first, optionally restricted to one agent.
    pub async fn list_runs(&self, agent_name: Option<&str>, limit: usize) -> StoreResult<Vec<Run>> {
        let db = self.db.lock().await;
        let limit = limit as i64;
        let mut runs = Vec::new();
        match agent_name {
            Some(agent) => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {} FROM runs WHERE agent_name = ?1
                     ORDER BY started_at DESC, rowid DESC LIMIT ?2",
                    RUN_COLUMNS
                ))?;
                for row in stmt.query_map(params![agent, limit], run_from_row)? {
                    runs.push(row?);
                }
            }
            None => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {} FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
                    RUN_COLUMNS
                ))?;
                for row in stmt.query_map(params![limit], run_from_row)? {
                    runs.push(row?);
                }
            }
        }
        Ok(runs)
    }

    /// Fail every run still marked running. Used at daemon start, when no
    /// task can be driving them any more.
    pub async fn abandon_running_runs(&self, reason: &str) -> StoreResult<usize> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE runs SET status = ?1, completed_at = ?2, error = ?3 WHERE status = ?4",
            params![RunStatus::Error, Utc::now(), reason, RunStatus::Running],
        )?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(model: &str) -> RunCompletion {
        RunCompletion {
            model: model.to_string(),
            output: "done".to_string(),
            input_tokens: 1_000_000,
            output_tokens: 0,
            tool_calls: 2,
            duration_ms: 1500,
        }
    }

    async fn insert_with_id(store: &RunStore, id: &str, agent: &str) {
        let db = store.db.lock().await;
        db.execute(
            "INSERT INTO runs (id, agent_name, status, started_at) VALUES (?1, ?2, 'running', ?3)",
            params![id, agent, Utc::now()],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn created_run_starts_running() {
        let store = RunStore::open_in_memory().unwrap();
        let id = store.create_run("digest").await.unwrap();
        let run = store.get_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.agent_name, "digest");
        assert!(run.completed_at.is_none());
        assert_eq!(run.tool_calls, 0);
    }

    #[tokio::test]
    async fn complete_run_records_totals_and_cost() {
        let store = RunStore::open_in_memory().unwrap();
        let id = store.create_run("digest").await.unwrap();
        assert!(store.complete_run(&id, &completion("gpt-4o")).await.unwrap());

        let run = store.get_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output.as_deref(), Some("done"));
        assert_eq!(run.tool_calls, 2);
        assert_eq!(run.duration_ms, Some(1500));
        assert!((run.cost - 2.5).abs() < 1e-9);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn second_terminal_write_is_rejected() {
        let store = RunStore::open_in_memory().unwrap();
        let id = store.create_run("digest").await.unwrap();
        assert!(store.fail_run(&id, "provider unavailable", 10).await.unwrap());
        assert!(!store.complete_run(&id, &completion("gpt-4o")).await.unwrap());
        assert!(!store.fail_run(&id, "again", 20).await.unwrap());

        let run = store.get_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_deref(), Some("provider unavailable"));
        assert_eq!(run.output, None);
        assert_eq!(run.duration_ms, Some(10));
    }

    #[tokio::test]
    async fn prefix_lookup_resolves_unique_matches() {
        let store = RunStore::open_in_memory().unwrap();
        insert_with_id(&store, "abc123", "a").await;
        insert_with_id(&store, "abd456", "a").await;
        insert_with_id(&store, "ff0000", "b").await;

        let full = store.get_run("abc123").await.unwrap();
        let short = store.get_run("abc").await.unwrap();
        assert_eq!(full, short);

        match store.get_run("ab").await {
            Err(StoreError::AmbiguousRunId { prefix, matches }) => {
                assert_eq!(prefix, "ab");
                assert_eq!(matches, 2);
            }
            other => panic!("expected ambiguous, got {:?}", other),
        }
        assert!(matches!(
            store.get_run("zz").await,
            Err(StoreError::RunNotFound(_))
        ));
        assert!(matches!(
            store.get_run("").await,
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn prefix_match_is_literal() {
        let store = RunStore::open_in_memory().unwrap();
        insert_with_id(&store, "a_c", "a").await;
        insert_with_id(&store, "abc", "a").await;
        // `_` is a LIKE wildcard; prefix lookup must not treat it as one.
        assert_eq!(store.get_run("a_").await.unwrap().id, "a_c");
    }

    #[tokio::test]
    async fn list_runs_is_most_recent_first_and_bounded() {
        let store = RunStore::open_in_memory().unwrap();
        let first = store.create_run("digest").await.unwrap();
        let second = store.create_run("digest").await.unwrap();
        store.create_run("other").await.unwrap();
        let third = store.create_run("digest").await.unwrap();

        let runs = store.list_runs(Some("digest"), 10).await.unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![third.as_str(), second.as_str(), first.as_str()]);

        assert_eq!(store.list_runs(Some("digest"), 2).await.unwrap().len(), 2);
        assert_eq!(store.list_runs(None, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn abandoned_runs_become_errors() {
        let store = RunStore::open_in_memory().unwrap();
        let running = store.create_run("digest").await.unwrap();
        let done = store.create_run("digest").await.unwrap();
        store.complete_run(&done, &completion("gpt-4o")).await.unwrap();

        let n = store.abandon_running_runs("daemon restarted").await.unwrap();
        assert_eq!(n, 1);
        let run = store.get_run(&running).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_deref(), Some("daemon restarted"));
        assert_eq!(
            store.get_run(&done).await.unwrap().status,
            RunStatus::Completed
        );
    }
}
