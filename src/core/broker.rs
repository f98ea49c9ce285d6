use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Logical task name carried by every plugin submission.
pub const PLUGIN_TASK_NAME: &str = "execute_plugin_task";
/// Default queue for plugin work.
pub const DEFAULT_QUEUE: &str = "plugin_tasks";
/// Queue used by high-priority manual and CDC triggers.
pub const HIGH_PRIORITY_QUEUE: &str = "high_priority";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionState {
    Queued,
    Started,
    Success,
    Error,
    Revoked,
}

impl SubmissionState {
    fn as_str(&self) -> &'static str {
        match self {
            SubmissionState::Queued => "queued",
            SubmissionState::Started => "started",
            SubmissionState::Success => "success",
            SubmissionState::Error => "error",
            SubmissionState::Revoked => "revoked",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "started" => SubmissionState::Started,
            "success" => SubmissionState::Success,
            "error" => SubmissionState::Error,
            "revoked" => SubmissionState::Revoked,
            _ => SubmissionState::Queued,
        }
    }
}

/// Per-submission execution hints.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub queue: String,
    pub priority: i64,
    pub time_limit: Option<i64>,
    pub retries: i64,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            priority: 5,
            time_limit: None,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: String,
    pub task_name: String,
    pub plugin_name: String,
    pub kwargs: serde_json::Value,
    pub queue: String,
    pub priority: i64,
    pub time_limit: Option<i64>,
    pub retries: i64,
    pub attempts: i64,
    pub state: SubmissionState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Gateway onto the broker queue and result store. Submission is
/// fire-and-forget from the scheduler's point of view; this type owns the
/// serialization of the broker call itself.
pub struct BrokerGateway {
    db: Arc<Mutex<Connection>>,
}

impl BrokerGateway {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Connection::open(path.as_ref())
            .with_context(|| format!("opening broker store at {}", path.as_ref().display()))?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS submissions (
                id          TEXT PRIMARY KEY,
                task_name   TEXT NOT NULL,
                plugin_name TEXT NOT NULL,
                kwargs      TEXT NOT NULL DEFAULT '{}',
                queue       TEXT NOT NULL,
                priority    INTEGER NOT NULL DEFAULT 5,
                time_limit  INTEGER,
                retries     INTEGER NOT NULL DEFAULT 3,
                attempts    INTEGER NOT NULL DEFAULT 0,
                status      TEXT NOT NULL DEFAULT 'queued',
                result      TEXT,
                error       TEXT,
                worker      TEXT,
                created_at  TEXT NOT NULL,
                started_at  TEXT,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sub_status ON submissions(status);
            CREATE INDEX IF NOT EXISTS idx_sub_queue ON submissions(queue, status);",
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Enqueue a plugin invocation. Returns the submission id.
    pub async fn submit(
        &self,
        plugin_name: &str,
        parameters: &serde_json::Value,
        options: &SubmitOptions,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO submissions
                (id, task_name, plugin_name, kwargs, queue, priority,
                 time_limit, retries, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued', ?9)",
            params![
                id,
                PLUGIN_TASK_NAME,
                plugin_name,
                parameters.to_string(),
                options.queue,
                options.priority,
                options.time_limit,
                options.retries,
                Utc::now().to_rfc3339(),
            ],
        )?;
        info!("submitted {} -> {} (queue={})", id, plugin_name, options.queue);
        Ok(id)
    }

    /// Immediate one-off invocation, as used by manual triggers and CDC
    /// consumers. High-priority work rides its own queue.
    pub async fn trigger_plugin(
        &self,
        plugin_name: &str,
        parameters: &serde_json::Value,
        high_priority: bool,
    ) -> Result<String> {
        let options = SubmitOptions {
            queue: if high_priority {
                HIGH_PRIORITY_QUEUE.to_string()
            } else {
                DEFAULT_QUEUE.to_string()
            },
            priority: if high_priority { 9 } else { 5 },
            ..SubmitOptions::default()
        };
        self.submit(plugin_name, parameters, &options).await
    }

    pub async fn status(&self, id: &str) -> Result<Option<Submission>> {
        let db = self.db.lock().await;
        let sub = db
            .query_row(
                "SELECT * FROM submissions WHERE id = ?1",
                params![id],
                row_to_submission,
            )
            .optional()?;
        Ok(sub)
    }

    /// Revoke one submission. A queued row is always revocable; a started
    /// one only with `terminate`. Finished rows are left alone.
    pub async fn revoke(&self, id: &str, terminate: bool) -> Result<bool> {
        let db = self.db.lock().await;
        let sql = if terminate {
            "UPDATE submissions SET status = 'revoked', finished_at = ?2
             WHERE id = ?1 AND status IN ('queued', 'started')"
        } else {
            "UPDATE submissions SET status = 'revoked', finished_at = ?2
             WHERE id = ?1 AND status = 'queued'"
        };
        let n = db.execute(sql, params![id, Utc::now().to_rfc3339()])?;
        if n > 0 {
            warn!("revoked submission {} (terminate={})", id, terminate);
        }
        Ok(n > 0)
    }

    /// Revoke every live submission of one plugin. Returns how many rows
    /// were flipped.
    pub async fn revoke_by_plugin(&self, plugin_name: &str, terminate: bool) -> Result<usize> {
        let db = self.db.lock().await;
        let sql = if terminate {
            "UPDATE submissions SET status = 'revoked', finished_at = ?2
             WHERE plugin_name = ?1 AND status IN ('queued', 'started')"
        } else {
            "UPDATE submissions SET status = 'revoked', finished_at = ?2
             WHERE plugin_name = ?1 AND status = 'queued'"
        };
        let n = db.execute(sql, params![plugin_name, Utc::now().to_rfc3339()])?;
        if n > 0 {
            warn!("revoked {} submission(s) of plugin {}", n, plugin_name);
        }
        Ok(n)
    }

    /// Queued and started submissions, newest first.
    pub async fn inspect_active(&self) -> Result<Vec<Submission>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT * FROM submissions WHERE status IN ('queued', 'started')
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_submission)?;
        let mut subs = Vec::new();
        for row in rows {
            subs.push(row?);
        }
        Ok(subs)
    }

    // ── Worker-side operations ─────────────────────────────────────────────

    /// Claim the highest-priority queued submission on one of `queues`,
    /// flipping it to `started`. Returns None when the queues are empty.
    pub async fn claim(&self, queues: &[String], worker: &str) -> Result<Option<Submission>> {
        let db = self.db.lock().await;
        let placeholders = queues.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id FROM submissions
             WHERE status = 'queued' AND queue IN ({placeholders})
             ORDER BY priority DESC, created_at ASC LIMIT 1"
        );
        let id: Option<String> = db
            .query_row(&sql, params_from_iter(queues.iter()), |r| r.get(0))
            .optional()?;
        let Some(id) = id else {
            return Ok(None);
        };
        let n = db.execute(
            "UPDATE submissions
             SET status = 'started', worker = ?2, started_at = ?3,
                 attempts = attempts + 1
             WHERE id = ?1 AND status = 'queued'",
            params![id, worker, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            // Lost the race to a revoke; let the caller poll again.
            return Ok(None);
        }
        let sub = db.query_row(
            "SELECT * FROM submissions WHERE id = ?1",
            params![id],
            row_to_submission,
        )?;
        Ok(Some(sub))
    }

    /// Record a successful run. The `status = 'started'` guard means a
    /// submission revoked mid-flight never transitions to success.
    pub async fn finish_success(&self, id: &str, result: &serde_json::Value) -> Result<bool> {
        let db = self.db.lock().await;
        let n = db.execute(
            "UPDATE submissions SET status = 'success', result = ?2, finished_at = ?3
             WHERE id = ?1 AND status = 'started'",
            params![id, result.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    /// Record a failed run, same guard as success.
    pub async fn finish_error(&self, id: &str, error: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let n = db.execute(
            "UPDATE submissions SET status = 'error', error = ?2, finished_at = ?3
             WHERE id = ?1 AND status = 'started'",
            params![id, error, Utc::now().to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    /// Put a failed-but-retriable submission back on its queue.
    pub async fn requeue(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let n = db.execute(
            "UPDATE submissions SET status = 'queued', worker = NULL
             WHERE id = ?1 AND status = 'started' AND attempts < retries + 1",
            params![id],
        )?;
        Ok(n > 0)
    }
}

fn row_to_submission(row: &Row<'_>) -> rusqlite::Result<Submission> {
    let kwargs: String = row.get("kwargs")?;
    let status: String = row.get("status")?;
    let result: Option<String> = row.get("result")?;
    Ok(Submission {
        id: row.get("id")?,
        task_name: row.get("task_name")?,
        plugin_name: row.get("plugin_name")?,
        kwargs: serde_json::from_str(&kwargs).unwrap_or_else(|_| serde_json::json!({})),
        queue: row.get("queue")?,
        priority: row.get("priority")?,
        time_limit: row.get("time_limit")?,
        retries: row.get("retries")?,
        attempts: row.get("attempts")?,
        state: SubmissionState::parse(&status),
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        error: row.get("error")?,
        worker: row.get("worker")?,
        created_at: parse_ts(row.get::<_, String>("created_at")?).unwrap_or_else(Utc::now),
        started_at: row
            .get::<_, Option<String>>("started_at")?
            .and_then(parse_ts),
        finished_at: row
            .get::<_, Option<String>>("finished_at")?
            .and_then(parse_ts),
    })
}

fn parse_ts(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
