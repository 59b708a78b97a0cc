//! InMemoryTaskStore - 開発・テスト用の TaskStore
//!
//! SqliteTaskStore と同じ意味論（version の CAS、stage 履歴、
//! 子タスク作成のアトミック性）をプロセス内で提供します。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{EngineError, StageEntry, TaskId, TaskRecord};
use crate::ports::{TaskQuery, TaskStore};

#[derive(Default)]
struct StoreState {
    records: HashMap<TaskId, TaskRecord>,
    history: HashMap<TaskId, Vec<StageEntry>>,
}

impl StoreState {
    fn check_version(&self, record: &TaskRecord) -> Result<(), EngineError> {
        let stored = self
            .records
            .get(&record.id)
            .ok_or(EngineError::TaskNotFound(record.id))?;
        if stored.version != record.version {
            return Err(EngineError::Conflict {
                task_id: record.id,
                expected: record.version,
            });
        }
        Ok(())
    }

    fn check_absent(&self, id: TaskId) -> Result<(), EngineError> {
        if self.records.contains_key(&id) {
            return Err(EngineError::Storage(format!("task {id} already exists")));
        }
        Ok(())
    }

    fn put(&mut self, record: TaskRecord) {
        self.history
            .entry(record.id)
            .or_default()
            .push(StageEntry::from_record(&record));
        self.records.insert(record.id, record);
    }

    fn bump(&mut self, record: &TaskRecord) -> TaskRecord {
        let mut saved = record.clone();
        saved.version += 1;
        self.put(saved.clone());
        saved
    }

    fn sorted(&self, query: &TaskQuery) -> Vec<TaskRecord> {
        let mut found: Vec<TaskRecord> = self
            .records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        found
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: &TaskRecord) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state.check_absent(record.id)?;
        state.put(record.clone());
        Ok(())
    }

    async fn load(&self, id: TaskId) -> Result<TaskRecord, EngineError> {
        let state = self.state.lock().await;
        state
            .records
            .get(&id)
            .cloned()
            .ok_or(EngineError::TaskNotFound(id))
    }

    async fn save_stage(&self, record: &TaskRecord) -> Result<TaskRecord, EngineError> {
        let mut state = self.state.lock().await;
        state.check_version(record)?;
        Ok(state.bump(record))
    }

    async fn spawn_child(
        &self,
        parent: &TaskRecord,
        child: &TaskRecord,
    ) -> Result<TaskRecord, EngineError> {
        let mut state = self.state.lock().await;
        // 両方の検証が済むまで何も書かない
        state.check_version(parent)?;
        state.check_absent(child.id)?;
        let saved = state.bump(parent);
        state.put(child.clone());
        Ok(saved)
    }

    async fn list_resumable(&self) -> Result<Vec<TaskRecord>, EngineError> {
        let state = self.state.lock().await;
        let mut found = state.sorted(&TaskQuery::new());
        found.retain(|r| r.status.is_resumable());
        Ok(found)
    }

    async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, EngineError> {
        Ok(self.state.lock().await.sorted(query))
    }

    async fn stage_history(&self, id: TaskId) -> Result<Vec<StageEntry>, EngineError> {
        let state = self.state.lock().await;
        if !state.records.contains_key(&id) {
            return Err(EngineError::TaskNotFound(id));
        }
        Ok(state.history.get(&id).cloned().unwrap_or_default())
    }
}
