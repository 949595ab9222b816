//! Durable backing store for the task queues.
//!
//! One SQLite database holds every queue's pending tasks, the dead-letter
//! records, and a journal of terminal transitions. Pending rows survive a
//! crash: `recover` flips tasks that were mid-flight back to `queued` at
//! startup. Successful tasks are deleted on completion; their trace lives in
//! the journal.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::task::{DeadLetter, QueueName, Task, TaskError, TaskKind, TaskParams};
use crate::frame::Frame;

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    kind TEXT NOT NULL,
    task_name TEXT NOT NULL,
    params TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'queued',
    available_at INTEGER NOT NULL DEFAULT 0,
    payload TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_tasks_queue_state
ON tasks(queue, state, available_at, id);

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_kind TEXT NOT NULL,
    task_name TEXT NOT NULL,
    params TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    last_error_kind TEXT NOT NULL,
    last_error_message TEXT NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS journal (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    task_name TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    finished_at TEXT DEFAULT CURRENT_TIMESTAMP
);
"#;

/// One journal row: a task that reached a terminal state.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub kind: TaskKind,
    pub task_name: String,
    pub correlation_id: Uuid,
    pub outcome: String,
}

/// The shared queue store.
///
/// rusqlite connections are Send but not Sync, so the connection sits behind
/// a tokio mutex shared by the enqueuers and every worker pool.
pub struct TaskStore {
    db: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Open (or create) the store at a path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open queue store {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory store, for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory queue store")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("set queue store pragmas")?;
        conn.execute_batch(CREATE_TABLES_SQL)
            .context("create queue store tables")?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Re-queue tasks that were running when the previous process died.
    pub async fn recover(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let recovered = db
            .execute("UPDATE tasks SET state = 'queued' WHERE state = 'running'", [])
            .context("recover running tasks")?;
        if recovered > 0 {
            info!(recovered, "Recovered in-flight tasks from previous run");
        }
        Ok(recovered)
    }

    /// Insert a task into its queue. Returns the assigned id.
    pub async fn enqueue(&self, task: &Task) -> Result<i64> {
        let db = self.db.lock().await;
        let params_json = serde_json::to_string(&task.params)?;
        let payload_json = task
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        db.execute(
            r#"
            INSERT INTO tasks (queue, kind, task_name, params, correlation_id, attempt, state, available_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?8)
            "#,
            params![
                task.kind.queue().as_str(),
                task.kind.as_str(),
                task.task_name,
                params_json,
                task.correlation_id.to_string(),
                task.attempt,
                Self::now_millis(),
                payload_json,
            ],
        )
        .context("enqueue task")?;

        let id = db.last_insert_rowid();
        debug!(
            id,
            queue = %task.kind.queue(),
            kind = task.kind.as_str(),
            task = %task.task_name,
            correlation_id = %task.correlation_id,
            "Enqueued task"
        );
        Ok(id)
    }

    /// Pop the oldest available task of a queue, marking it running.
    pub async fn pop(&self, queue: QueueName) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let now = Self::now_millis();

        let row: Option<(i64, String, String, String, String, u32, Option<String>)> = db
            .query_row(
                r#"
                SELECT id, kind, task_name, params, correlation_id, attempt, payload
                FROM tasks
                WHERE queue = ?1 AND state = 'queued' AND available_at <= ?2
                ORDER BY id
                LIMIT 1
                "#,
                params![queue.as_str(), now],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("pop task")?;

        let Some((id, kind, task_name, params_json, correlation, attempt, payload_json)) = row
        else {
            return Ok(None);
        };

        db.execute("UPDATE tasks SET state = 'running' WHERE id = ?1", params![id])
            .context("mark task running")?;

        let kind = match kind.as_str() {
            "plan" => TaskKind::Plan,
            "download" => TaskKind::Download,
            "persist" => TaskKind::Persist,
            _ => TaskKind::Maintenance,
        };
        let params: TaskParams = serde_json::from_str(&params_json)?;
        let payload: Option<Frame> = payload_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Some(Task {
            id,
            kind,
            task_name,
            params,
            correlation_id: Uuid::parse_str(&correlation).unwrap_or_else(|_| Uuid::nil()),
            attempt,
            payload,
        }))
    }

    /// Terminal success (or succeeded-noop): delete and journal.
    pub async fn complete(&self, task: &Task, outcome: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute("DELETE FROM tasks WHERE id = ?1", params![task.id])?;
        db.execute(
            "INSERT INTO journal (kind, task_name, correlation_id, outcome) VALUES (?1, ?2, ?3, ?4)",
            params![
                task.kind.as_str(),
                task.task_name,
                task.correlation_id.to_string(),
                outcome,
            ],
        )?;
        Ok(())
    }

    /// Transient failure: bump the attempt and delay availability.
    pub async fn retry(&self, task: &Task, delay: std::time::Duration) -> Result<()> {
        let db = self.db.lock().await;
        let available_at = Self::now_millis() + delay.as_millis() as i64;
        db.execute(
            "UPDATE tasks SET state = 'queued', attempt = ?2, available_at = ?3 WHERE id = ?1",
            params![task.id, task.attempt + 1, available_at],
        )
        .context("re-enqueue task")?;
        Ok(())
    }

    /// Permanent failure: move to the dead-letter store and journal.
    pub async fn dead_letter(&self, task: &Task, error: &TaskError) -> Result<()> {
        let db = self.db.lock().await;
        let params_json = serde_json::to_string(&task.params)?;
        db.execute(
            r#"
            INSERT INTO dead_letters (task_kind, task_name, params, attempts, last_error_kind, last_error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                task.kind.as_str(),
                task.task_name,
                params_json,
                task.attempt + 1,
                error.kind(),
                error.to_string(),
            ],
        )?;
        db.execute("DELETE FROM tasks WHERE id = ?1", params![task.id])?;
        db.execute(
            "INSERT INTO journal (kind, task_name, correlation_id, outcome) VALUES (?1, ?2, ?3, 'dead_letter')",
            params![
                task.kind.as_str(),
                task.task_name,
                task.correlation_id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Tasks still queued or running in a queue.
    pub async fn pending(&self, queue: QueueName) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM tasks WHERE queue = ?1",
            params![queue.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Tasks still queued or running anywhere.
    pub async fn pending_total(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// All dead-letter records, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT task_kind, task_name, params, attempts, last_error_kind, last_error_message
             FROM dead_letters ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let kind: String = row.get(0)?;
            let params_json: String = row.get(2)?;
            Ok((kind, row.get::<_, String>(1)?, params_json, row.get::<_, u32>(3)?, row.get::<_, String>(4)?, row.get::<_, String>(5)?))
        })?;

        let mut letters = Vec::new();
        for row in rows {
            let (kind, task_name, params_json, attempts, error_kind, error_message) = row?;
            letters.push(DeadLetter {
                task_kind: match kind.as_str() {
                    "plan" => TaskKind::Plan,
                    "download" => TaskKind::Download,
                    "persist" => TaskKind::Persist,
                    _ => TaskKind::Maintenance,
                },
                task_name,
                params: serde_json::from_str(&params_json).unwrap_or_default(),
                attempts,
                last_error_kind: error_kind,
                last_error_message: error_message,
            });
        }
        Ok(letters)
    }

    /// Journal entries of one kind, oldest first.
    pub async fn journal(&self, kind: TaskKind) -> Result<Vec<JournalEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT task_name, correlation_id, outcome FROM journal WHERE kind = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (task_name, correlation, outcome) = row?;
            entries.push(JournalEntry {
                kind,
                task_name,
                correlation_id: Uuid::parse_str(&correlation).unwrap_or_else(|_| Uuid::nil()),
                outcome,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::task::TaskParams;

    fn download(name: &str) -> Task {
        Task::download(
            name,
            TaskParams {
                symbol: Some("600519.SH".into()),
                start: Some("20240311".into()),
                end: Some("20240315".into()),
                extra: Default::default(),
            },
        )
    }

    #[tokio::test]
    async fn test_enqueue_pop_complete() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut task = download("stock_daily");
        task.id = store.enqueue(&task).await.unwrap();

        let popped = store.pop(QueueName::Fast).await.unwrap().unwrap();
        assert_eq!(popped.id, task.id);
        assert_eq!(popped.task_name, "stock_daily");
        assert_eq!(popped.params, task.params);
        assert_eq!(popped.correlation_id, task.correlation_id);

        // Running tasks are not handed out twice
        assert!(store.pop(QueueName::Fast).await.unwrap().is_none());

        store.complete(&popped, "succeeded").await.unwrap();
        assert_eq!(store.pending(QueueName::Fast).await.unwrap(), 0);

        let journal = store.journal(TaskKind::Download).await.unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].outcome, "succeeded");
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let store = TaskStore::open_in_memory().unwrap();
        for name in ["a", "b", "c"] {
            store.enqueue(&download(name)).await.unwrap();
        }
        let first = store.pop(QueueName::Fast).await.unwrap().unwrap();
        assert_eq!(first.task_name, "a");
        store.complete(&first, "succeeded").await.unwrap();
        let second = store.pop(QueueName::Fast).await.unwrap().unwrap();
        assert_eq!(second.task_name, "b");
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let store = TaskStore::open_in_memory().unwrap();
        store.enqueue(&Task::plan("daily")).await.unwrap();
        assert!(store.pop(QueueName::Fast).await.unwrap().is_none());
        assert!(store.pop(QueueName::Maint).await.unwrap().is_none());
        assert!(store.pop(QueueName::Slow).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_delays_availability() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut task = download("stock_daily");
        task.id = store.enqueue(&task).await.unwrap();
        let popped = store.pop(QueueName::Fast).await.unwrap().unwrap();

        store
            .retry(&popped, std::time::Duration::from_secs(3600))
            .await
            .unwrap();
        // Not yet available
        assert!(store.pop(QueueName::Fast).await.unwrap().is_none());
        assert_eq!(store.pending(QueueName::Fast).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_bumps_attempt() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut task = download("stock_daily");
        task.id = store.enqueue(&task).await.unwrap();
        let popped = store.pop(QueueName::Fast).await.unwrap().unwrap();
        store.retry(&popped, std::time::Duration::ZERO).await.unwrap();

        let again = store.pop(QueueName::Fast).await.unwrap().unwrap();
        assert_eq!(again.attempt, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_record() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut task = download("stock_daily");
        task.id = store.enqueue(&task).await.unwrap();
        let popped = store.pop(QueueName::Fast).await.unwrap().unwrap();

        let err = TaskError::permanent("bad_params", "unknown parameter 'x'");
        store.dead_letter(&popped, &err).await.unwrap();

        assert_eq!(store.pending(QueueName::Fast).await.unwrap(), 0);
        let letters = store.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task_kind, TaskKind::Download);
        assert_eq!(letters[0].last_error_kind, "bad_params");
        assert_eq!(letters[0].attempts, 1);
        assert_eq!(letters[0].params.symbol.as_deref(), Some("600519.SH"));
    }

    #[tokio::test]
    async fn test_recover_requeues_running() {
        let store = TaskStore::open_in_memory().unwrap();
        let mut task = download("stock_daily");
        task.id = store.enqueue(&task).await.unwrap();
        let _running = store.pop(QueueName::Fast).await.unwrap().unwrap();

        assert_eq!(store.recover().await.unwrap(), 1);
        assert!(store.pop(QueueName::Fast).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_payload_round_trips() {
        use crate::frame::Cell;
        let store = TaskStore::open_in_memory().unwrap();

        let download = download("stock_daily");
        let mut frame = Frame::new(vec!["ts_code".into(), "close".into()]);
        frame
            .push_row(vec![Cell::Str("600519.SH".into()), Cell::Float(1700.5)])
            .unwrap();

        let mut persist = Task::persist(&download, frame);
        persist.id = store.enqueue(&persist).await.unwrap();

        let popped = store.pop(QueueName::Slow).await.unwrap().unwrap();
        let payload = popped.payload.unwrap();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload.rows()[0][1], Cell::Float(1700.5));
    }
}
