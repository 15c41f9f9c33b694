//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `localflow-core` using sqlx with split
//! read/write pools. Instance snapshots are split into a header row and
//! append-only history rows; the global event log, outstanding timers and
//! compiled definitions each get their own table.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use localflow_core::repository::workflow::WorkflowStore;
use localflow_types::error::RepositoryError;
use localflow_types::timer::Timer;
use localflow_types::workflow::{
    EventKind, WorkflowDefinition, WorkflowEvent, WorkflowInstance, WorkflowStatus,
};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    name: String,
    status: String,
    replay_cursor: i64,
    created_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            replay_cursor: row.try_get("replay_cursor")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_instance(self, events: Vec<WorkflowEvent>) -> Result<WorkflowInstance, RepositoryError> {
        let status: WorkflowStatus =
            serde_json::from_value(serde_json::Value::String(self.status.clone()))
                .map_err(|_| RepositoryError::Query(format!("invalid workflow status: {}", self.status)))?;

        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            name: self.name,
            status,
            events,
            replay_cursor: to_usize(self.replay_cursor, "replay_cursor")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

/// Shared by `workflow_events` and `event_log`, which have the same columns.
struct EventRow {
    id: String,
    workflow_id: String,
    position: i64,
    sequence: i64,
    timestamp: String,
    kind: String,
    step_index: Option<i64>,
    payload: String,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            position: row.try_get("position")?,
            sequence: row.try_get("sequence")?,
            timestamp: row.try_get("timestamp")?,
            kind: row.try_get("kind")?,
            step_index: row.try_get("step_index")?,
            payload: row.try_get("payload")?,
        })
    }

    fn into_event(self) -> Result<WorkflowEvent, RepositoryError> {
        let kind: EventKind = self.kind.parse().map_err(RepositoryError::Query)?;
        let payload: serde_json::Value = serde_json::from_str(&self.payload)
            .map_err(|e| RepositoryError::Query(format!("invalid event payload: {e}")))?;
        let sequence = u64::try_from(self.sequence)
            .map_err(|_| RepositoryError::Query(format!("invalid sequence: {}", self.sequence)))?;

        Ok(WorkflowEvent {
            id: parse_uuid(&self.id)?,
            sequence,
            position: to_usize(self.position, "position")?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            timestamp: parse_datetime(&self.timestamp)?,
            kind,
            step_index: self
                .step_index
                .map(|i| to_usize(i, "step_index"))
                .transpose()?,
            payload,
        })
    }
}

struct TimerRow {
    id: String,
    workflow_id: String,
    fire_at: String,
    duration_secs: i64,
    created_at: String,
}

impl TimerRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            fire_at: row.try_get("fire_at")?,
            duration_secs: row.try_get("duration_secs")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_timer(self) -> Result<Timer, RepositoryError> {
        Ok(Timer {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            fire_at: parse_datetime(&self.fire_at)?,
            duration_secs: self.duration_secs,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn to_usize(value: i64, column: &str) -> Result<usize, RepositoryError> {
    usize::try_from(value).map_err(|_| RepositoryError::Query(format!("invalid {column}: {value}")))
}

fn to_i64(value: usize) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| RepositoryError::Query(format!("value out of range: {value}")))
}

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn event_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowEvent>, RepositoryError> {
    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        events.push(EventRow::from_row(row).map_err(query_err)?.into_event()?);
    }
    Ok(events)
}

/// Insert `event` into `table` unless an event with the same key is stored.
async fn insert_event<'e, E>(executor: E, table: &str, event: &WorkflowEvent) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let payload = serde_json::to_string(&event.payload)
        .map_err(|e| RepositoryError::Query(format!("serialize payload: {e}")))?;
    let sequence = i64::try_from(event.sequence)
        .map_err(|_| RepositoryError::Query(format!("sequence out of range: {}", event.sequence)))?;
    let step_index = event.step_index.map(to_i64).transpose()?;

    sqlx::query(&format!(
        "INSERT OR IGNORE INTO {table}
           (id, workflow_id, position, sequence, timestamp, kind, step_index, payload)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(event.id.to_string())
    .bind(event.workflow_id.to_string())
    .bind(to_i64(event.position)?)
    .bind(sequence)
    .bind(format_datetime(&event.timestamp))
    .bind(event.kind.as_str())
    .bind(step_index)
    .bind(&payload)
    .execute(executor)
    .await
    .map_err(query_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_instances (id, name, status, replay_cursor, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 replay_cursor = excluded.replay_cursor,
                 updated_at = excluded.updated_at"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.name)
        .bind(instance.status.as_str())
        .bind(to_i64(instance.replay_cursor)?)
        .bind(format_datetime(&instance.created_at))
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        // History is append-only: only write what the stored copy lacks.
        let (stored,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workflow_events WHERE workflow_id = ?")
                .bind(instance.id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(query_err)?;
        let stored = to_usize(stored, "event count")?;

        if stored > instance.events.len() {
            sqlx::query("DELETE FROM workflow_events WHERE workflow_id = ? AND position >= ?")
                .bind(instance.id.to_string())
                .bind(to_i64(instance.events.len())?)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }
        for event in instance.events.iter().skip(stored) {
            insert_event(&mut *tx, "workflow_events", event).await?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn load_instance(&self, id: &Uuid) -> Result<WorkflowInstance, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?
            .ok_or(RepositoryError::NotFound)?;

        let history = sqlx::query(
            "SELECT * FROM workflow_events WHERE workflow_id = ? ORDER BY position ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        InstanceRow::from_row(&row)
            .map_err(query_err)?
            .into_instance(event_rows(&history)?)
    }

    async fn list_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflow_instances ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let all_events = sqlx::query("SELECT * FROM workflow_events ORDER BY workflow_id, position ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut histories: HashMap<Uuid, Vec<WorkflowEvent>> = HashMap::new();
        for event in event_rows(&all_events)? {
            histories.entry(event.workflow_id).or_default().push(event);
        }

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(query_err)?;
            let id = parse_uuid(&r.id)?;
            instances.push(r.into_instance(histories.remove(&id).unwrap_or_default())?);
        }
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(instances)
    }

    async fn save_event_log(&self, events: &[WorkflowEvent]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        for event in events {
            insert_event(&mut *tx, "event_log", event).await?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn load_event_log(&self) -> Result<Vec<WorkflowEvent>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM event_log ORDER BY sequence ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        event_rows(&rows)
    }

    async fn save_timer(&self, timer: &Timer) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO timers (id, workflow_id, fire_at, duration_secs, created_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 workflow_id = excluded.workflow_id,
                 fire_at = excluded.fire_at,
                 duration_secs = excluded.duration_secs,
                 created_at = excluded.created_at"#,
        )
        .bind(timer.id.to_string())
        .bind(timer.workflow_id.to_string())
        .bind(format_datetime(&timer.fire_at))
        .bind(timer.duration_secs)
        .bind(format_datetime(&timer.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn delete_timer(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM timers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_timers(&self) -> Result<Vec<Timer>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM timers")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut timers = Vec::with_capacity(rows.len());
        for row in &rows {
            timers.push(TimerRow::from_row(row).map_err(query_err)?.into_timer()?);
        }
        // Sorted here: RFC 3339 strings with varying precision do not sort lexically.
        timers.sort_by(|a, b| {
            a.fire_at
                .cmp(&b.fire_at)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(timers)
    }

    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_definitions (name, definition, registered_at, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 definition = excluded.definition,
                 registered_at = excluded.registered_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&def.name)
        .bind(&definition_json)
        .bind(format_datetime(&def.registered_at))
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_definition(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|r| parse_definition(&r)).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflow_definitions ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter().map(parse_definition).collect()
    }
}

fn parse_definition(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let json: String = row.try_get("definition").map_err(query_err)?;
    serde_json::from_str(&json)
        .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
