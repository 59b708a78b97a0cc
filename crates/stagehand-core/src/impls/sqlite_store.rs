//! SqliteTaskStore - rusqlite による永続 TaskStore
//!
//! テーブル:
//! - tasks: Task Record 1 件 = 1 行。payload / actor / continuation は JSON テキスト
//! - stage_history: save のたびに追記される履歴
//!
//! save_stage は `UPDATE ... WHERE id = ? AND version = ?` で CAS します。
//! spawn_child は親の CAS と子の INSERT を 1 トランザクションで行います。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use tracing::debug;

use crate::domain::{
    Actor, Continuation, EngineError, Payload, StageEntry, TargetRef, TaskId, TaskRecord,
    TaskStatus,
};
use crate::ports::{TaskQuery, TaskStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    type_name TEXT NOT NULL,
    target TEXT NOT NULL,
    parent_id TEXT,
    continuation TEXT,
    waiting_on TEXT,
    stage TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('pending', 'running', 'complete', 'failed')),
    actor TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);

CREATE TABLE IF NOT EXISTS stage_history (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    at TEXT NOT NULL,
    FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_stage_history_task ON stage_history(task_id, seq);
"#;

const SELECT_TASK: &str = "SELECT id, type_name, target, parent_id, continuation, waiting_on, \
     stage, payload, status, actor, version, created_at, updated_at FROM tasks";

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> EngineError + '_ {
    move |e| EngineError::Storage(format!("{context}: {e}"))
}

fn json_err(e: serde_json::Error) -> EngineError {
    EngineError::Storage(format!("corrupt json column: {e}"))
}

/// Fixed-width RFC3339 so TEXT ordering matches time ordering.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn parse_id(raw: &str) -> Result<TaskId, EngineError> {
    raw.parse()
        .map_err(|e| EngineError::Storage(format!("bad task id: {e}")))
}

fn to_i64(version: u64) -> Result<i64, EngineError> {
    i64::try_from(version).map_err(|_| EngineError::Storage(format!("version {version} overflows")))
}

/// Raw column values; decoded outside the rusqlite row closure so decode
/// failures surface as `EngineError::Storage`.
struct TaskRow {
    id: String,
    type_name: String,
    target: String,
    parent_id: Option<String>,
    continuation: Option<String>,
    waiting_on: Option<String>,
    stage: String,
    payload: String,
    status: String,
    actor: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            type_name: row.get(1)?,
            target: row.get(2)?,
            parent_id: row.get(3)?,
            continuation: row.get(4)?,
            waiting_on: row.get(5)?,
            stage: row.get(6)?,
            payload: row.get(7)?,
            status: row.get(8)?,
            actor: row.get(9)?,
            version: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, EngineError> {
        let continuation: Option<Continuation> = self
            .continuation
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(json_err)?;
        let actor: Actor = serde_json::from_str(&self.actor).map_err(json_err)?;
        let payload: Payload = serde_json::from_str(&self.payload).map_err(json_err)?;

        Ok(TaskRecord {
            id: parse_id(&self.id)?,
            type_name: self.type_name,
            target: self.target.parse::<TargetRef>()?,
            parent_id: self.parent_id.as_deref().map(parse_id).transpose()?,
            continuation,
            waiting_on: self.waiting_on.as_deref().map(parse_id).transpose()?,
            stage: self.stage,
            payload,
            status: self.status.parse()?,
            actor,
            version: u64::try_from(self.version)
                .map_err(|_| EngineError::Storage(format!("negative version {}", self.version)))?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Column values for one record, already encoded.
struct Encoded {
    id: String,
    parent_id: Option<String>,
    continuation: Option<String>,
    waiting_on: Option<String>,
    payload: String,
    actor: String,
}

impl Encoded {
    fn of(record: &TaskRecord) -> Result<Self, EngineError> {
        Ok(Self {
            id: record.id.to_string(),
            parent_id: record.parent_id.map(|p| p.to_string()),
            continuation: record
                .continuation
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(json_err)?,
            waiting_on: record.waiting_on.map(|w| w.to_string()),
            payload: serde_json::to_string(&record.payload).map_err(json_err)?,
            actor: serde_json::to_string(&record.actor).map_err(json_err)?,
        })
    }
}

fn insert_row(tx: &Transaction<'_>, record: &TaskRecord) -> Result<(), EngineError> {
    let enc = Encoded::of(record)?;
    tx.execute(
        "INSERT INTO tasks (id, type_name, target, parent_id, continuation, waiting_on, stage, \
         payload, status, actor, version, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            enc.id,
            record.type_name,
            record.target.to_string(),
            enc.parent_id,
            enc.continuation,
            enc.waiting_on,
            record.stage,
            enc.payload,
            record.status.as_str(),
            enc.actor,
            to_i64(record.version)?,
            ts(&record.created_at),
            ts(&record.updated_at),
        ],
    )
    .map_err(db_err("insert task"))?;
    append_history(tx, record)
}

/// CAS update; returns the stored record with the bumped version.
fn update_row(tx: &Transaction<'_>, record: &TaskRecord) -> Result<TaskRecord, EngineError> {
    let enc = Encoded::of(record)?;
    let mut saved = record.clone();
    saved.version += 1;

    let changed = tx
        .execute(
            "UPDATE tasks SET continuation = ?1, waiting_on = ?2, stage = ?3, payload = ?4, \
             status = ?5, version = ?6, updated_at = ?7 WHERE id = ?8 AND version = ?9",
            params![
                enc.continuation,
                enc.waiting_on,
                record.stage,
                enc.payload,
                record.status.as_str(),
                to_i64(saved.version)?,
                ts(&record.updated_at),
                enc.id,
                to_i64(record.version)?,
            ],
        )
        .map_err(db_err("update task"))?;

    if changed == 0 {
        let exists: Option<i64> = tx
            .query_row("SELECT version FROM tasks WHERE id = ?1", params![enc.id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err("check task"))?;
        return Err(match exists {
            Some(_) => EngineError::Conflict {
                task_id: record.id,
                expected: record.version,
            },
            None => EngineError::TaskNotFound(record.id),
        });
    }

    append_history(tx, &saved)?;
    Ok(saved)
}

fn append_history(tx: &Transaction<'_>, record: &TaskRecord) -> Result<(), EngineError> {
    let entry = StageEntry::from_record(record);
    tx.execute(
        "INSERT INTO stage_history (task_id, stage, status, actor_id, at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.task_id.to_string(),
            entry.stage,
            entry.status.as_str(),
            entry.actor_id,
            ts(&entry.at),
        ],
    )
    .map_err(db_err("append stage history"))?;
    Ok(())
}

/// Durable task store.
///
/// 複数のエンジンインスタンスが同じファイルを開いても、CAS により
/// 同じ stage を二重に確定させることはありません。
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(db_err("open database"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
            .map_err(db_err("set pragmas"))?;
        debug!(path = %path.display(), "opened sqlite task store");
        Self::init(conn)
    }

    /// For tests.
    pub fn in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(db_err("open in-memory database"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, EngineError> {
        conn.execute_batch(SCHEMA).map_err(db_err("initialize schema"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Storage("connection lock poisoned".to_string()))
    }

    fn select(&self, sql: &str, args: Vec<String>) -> Result<Vec<TaskRecord>, EngineError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(db_err("prepare query"))?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), TaskRow::read)
            .map_err(db_err("run query"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("read rows"))?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, record: &TaskRecord) -> Result<(), EngineError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("begin"))?;
        insert_row(&tx, record)?;
        tx.commit().map_err(db_err("commit"))
    }

    async fn load(&self, id: TaskId) -> Result<TaskRecord, EngineError> {
        let row = {
            let conn = self.lock()?;
            conn.query_row(
                &format!("{SELECT_TASK} WHERE id = ?1"),
                params![id.to_string()],
                TaskRow::read,
            )
            .optional()
            .map_err(db_err("load task"))?
        };
        row.ok_or(EngineError::TaskNotFound(id))?.into_record()
    }

    async fn save_stage(&self, record: &TaskRecord) -> Result<TaskRecord, EngineError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("begin"))?;
        let saved = update_row(&tx, record)?;
        tx.commit().map_err(db_err("commit"))?;
        Ok(saved)
    }

    async fn spawn_child(
        &self,
        parent: &TaskRecord,
        child: &TaskRecord,
    ) -> Result<TaskRecord, EngineError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("begin"))?;
        // どちらかが失敗すれば tx は drop され rollback される
        let saved = update_row(&tx, parent)?;
        insert_row(&tx, child)?;
        tx.commit().map_err(db_err("commit"))?;
        Ok(saved)
    }

    async fn list_resumable(&self) -> Result<Vec<TaskRecord>, EngineError> {
        self.select(
            &format!(
                "{SELECT_TASK} WHERE status IN ('pending', 'running') ORDER BY created_at, id"
            ),
            Vec::new(),
        )
    }

    async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, EngineError> {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(status) = query.status {
            clauses.push("status = ?");
            args.push(status.as_str().to_string());
        }
        if let Some(target) = &query.target {
            clauses.push("target = ?");
            args.push(target.to_string());
        }
        if let Some(type_name) = &query.type_name {
            clauses.push("type_name = ?");
            args.push(type_name.clone());
        }
        if let Some(parent) = query.parent_id {
            clauses.push("parent_id = ?");
            args.push(parent.to_string());
        }

        let mut sql = SELECT_TASK.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at, id");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        self.select(&sql, args)
    }

    async fn stage_history(&self, id: TaskId) -> Result<Vec<StageEntry>, EngineError> {
        // 存在確認（履歴が空でも TaskNotFound と区別する）
        self.load(id).await?;

        let raw = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT stage, status, actor_id, at FROM stage_history \
                     WHERE task_id = ?1 ORDER BY seq",
                )
                .map_err(db_err("prepare history"))?;
            stmt.query_map(params![id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(db_err("read history"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("read history"))?
        };

        raw.into_iter()
            .map(|(stage, status, actor_id, at)| {
                Ok(StageEntry {
                    task_id: id,
                    stage,
                    status: status.parse::<TaskStatus>()?,
                    actor_id,
                    at: parse_ts(&at)?,
                })
            })
            .collect()
    }
}
