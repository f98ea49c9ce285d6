use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

/// A persisted task definition. The store is the sole owner of this state;
/// the beat scheduler holds read-only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub plugin_name: String,
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
    pub schedule_type: ScheduleType,
    pub schedule_config: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Interval,
    Cron,
}

impl ScheduleType {
    fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Interval => "interval",
            ScheduleType::Cron => "cron",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "interval" => Some(ScheduleType::Interval),
            "cron" => Some(ScheduleType::Cron),
            _ => None,
        }
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i64 {
    5
}

fn default_max_retries() -> i64 {
    3
}

/// SQLite-backed task store. All reads run inside a single statement or
/// transaction, so every snapshot is consistent.
pub struct TaskStore {
    db: Arc<Mutex<Connection>>,
}

impl TaskStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Connection::open(path.as_ref())
            .with_context(|| format!("opening task store at {}", path.as_ref().display()))?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                description     TEXT,
                tags            TEXT NOT NULL DEFAULT '[]',
                plugin_name     TEXT NOT NULL,
                parameters      TEXT NOT NULL DEFAULT '{}',
                schedule_type   TEXT NOT NULL,
                schedule_config TEXT NOT NULL,
                enabled         INTEGER NOT NULL DEFAULT 1,
                priority        INTEGER NOT NULL DEFAULT 5,
                max_retries     INTEGER NOT NULL DEFAULT 3,
                timeout_seconds INTEGER,
                last_run        TEXT,
                next_run        TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_enabled ON scheduled_tasks(enabled);
            CREATE INDEX IF NOT EXISTS idx_tasks_updated ON scheduled_tasks(updated_at);",
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// All enabled tasks, ordered by id for stable hashing downstream.
    pub async fn list_enabled(&self) -> Result<Vec<Task>> {
        self.query_tasks("WHERE enabled = 1").await
    }

    /// Every row, including disabled ones. The beat change detector needs
    /// the full enabled-flag map to see 1->0 transitions.
    pub async fn list_all(&self) -> Result<Vec<Task>> {
        self.query_tasks("").await
    }

    async fn query_tasks(&self, filter: &str) -> Result<Vec<Task>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT * FROM scheduled_tasks {filter} ORDER BY id");
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let task = db
            .query_row(
                "SELECT * FROM scheduled_tasks WHERE id = ?1",
                params![id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// Insert or replace a task definition. Always refreshes `updated_at`,
    /// which is what makes the edit visible to the beat change detector.
    pub async fn upsert(&self, task: &Task) -> Result<()> {
        let db = self.db.lock().await;
        let now = Utc::now();
        db.execute(
            "INSERT INTO scheduled_tasks
                (id, name, description, tags, plugin_name, parameters,
                 schedule_type, schedule_config, enabled, priority,
                 max_retries, timeout_seconds, last_run, next_run,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                tags = excluded.tags,
                plugin_name = excluded.plugin_name,
                parameters = excluded.parameters,
                schedule_type = excluded.schedule_type,
                schedule_config = excluded.schedule_config,
                enabled = excluded.enabled,
                priority = excluded.priority,
                max_retries = excluded.max_retries,
                timeout_seconds = excluded.timeout_seconds,
                updated_at = excluded.updated_at",
            params![
                task.id,
                task.name,
                task.description,
                serde_json::to_string(&task.tags)?,
                task.plugin_name,
                task.parameters.to_string(),
                task.schedule_type.as_str(),
                task.schedule_config.to_string(),
                task.enabled as i64,
                task.priority,
                task.max_retries,
                task.timeout_seconds,
                task.last_run.map(|t| t.to_rfc3339()),
                task.next_run.map(|t| t.to_rfc3339()),
                task.created_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        info!("persisted task {}", task.id);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let n = db.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Flip the enabled flag, bumping `updated_at` like any user edit.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let db = self.db.lock().await;
        let n = db.execute(
            "UPDATE scheduled_tasks SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, enabled as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    /// Record a dispatch. This path must NOT bump `updated_at`: a fire that
    /// looked like a user edit would retrigger reconciliation forever.
    pub async fn touch_last_run(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE scheduled_tasks SET last_run = ?2, next_run = ?3 WHERE id = ?1",
            params![
                id,
                last_run.to_rfc3339(),
                next_run.map(|t| t.to_rfc3339())
            ],
        )?;
        Ok(())
    }

    /// Null out the run state for a re-enabled task so the schedule
    /// evaluator treats it as immediately eligible. Also a no-touch write.
    pub async fn clear_run_state(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE scheduled_tasks SET last_run = NULL, next_run = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let tags: String = row.get("tags")?;
    let parameters: String = row.get("parameters")?;
    let schedule_type: String = row.get("schedule_type")?;
    let schedule_config: String = row.get("schedule_config")?;
    Ok(Task {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        plugin_name: row.get("plugin_name")?,
        parameters: serde_json::from_str(&parameters)
            .unwrap_or_else(|_| serde_json::json!({})),
        schedule_type: ScheduleType::parse(&schedule_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("unknown schedule_type '{schedule_type}'").into(),
            )
        })?,
        schedule_config: serde_json::from_str(&schedule_config)
            .unwrap_or_else(|_| serde_json::json!({})),
        enabled: row.get::<_, i64>("enabled")? != 0,
        priority: row.get("priority")?,
        max_retries: row.get("max_retries")?,
        timeout_seconds: row.get("timeout_seconds")?,
        last_run: parse_ts(row.get::<_, Option<String>>("last_run")?),
        next_run: parse_ts(row.get::<_, Option<String>>("next_run")?),
        created_at: parse_ts(Some(row.get::<_, String>("created_at")?)).unwrap_or_else(Utc::now),
        updated_at: parse_ts(Some(row.get::<_, String>("updated_at")?)).unwrap_or_else(Utc::now),
    })
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    })
}
