use chrono::{DateTime, Utc};
use rusqlite::params;

use super::types::{Event, EventType};
use super::{RunStore, StoreResult};

impl RunStore {
    /// Append one event to a run's timeline.
    pub async fn log_event(
        &self,
        run_id: &str,
        event_type: EventType,
        data: &serde_json::Value,
    ) -> StoreResult<()> {
        let payload = serde_json::to_string(data)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO events (run_id, event_type, timestamp, data) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, event_type, Utc::now(), payload],
        )?;
        Ok(())
    }

    /// Events of one run in insertion order.
    pub async fn get_events(&self, run_id: &str) -> StoreResult<Vec<Event>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, run_id, event_type, timestamp, data FROM events
             WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, EventType>(2)?,
                row.get::<_, DateTime<Utc>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, run_id, event_type, timestamp, data) = row?;
            events.push(Event {
                id,
                run_id,
                event_type,
                timestamp,
                data: serde_json::from_str(&data)?,
            });
        }
        Ok(events)
    }
}
