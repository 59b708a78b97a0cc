//! TaskStore port - Task Record の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - Task Record（stage, status, payload, version）
//! - stage 履歴（save_stage のたびに追記）
//!
//! # 設計原則
//! - save_stage は version の compare-and-set。読み込み後に変更されていたら Conflict
//! - 子タスクの作成と親の待機状態への遷移は同一トランザクション（spawn_child）
//! - すべての実行中の状態は list_resumable から再構築可能

use async_trait::async_trait;

use crate::domain::{EngineError, StageEntry, TargetRef, TaskId, TaskRecord, TaskStatus};

/// Read-only filter for operator tooling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub target: Option<TargetRef>,
    pub type_name: Option<String>,
    pub parent_id: Option<TaskId>,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_target(mut self, target: TargetRef) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.target.as_ref().is_none_or(|t| &record.target == t)
            && self.type_name.as_deref().is_none_or(|t| record.type_name == t)
            && self.parent_id.is_none_or(|p| record.parent_id == Some(p))
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a brand-new record (version 0).
    async fn insert(&self, record: &TaskRecord) -> Result<(), EngineError>;

    /// `TaskNotFound` when absent.
    async fn load(&self, id: TaskId) -> Result<TaskRecord, EngineError>;

    /// Compare-and-set on `record.version`; returns the stored record with the
    /// bumped version and appends a stage history entry.
    async fn save_stage(&self, record: &TaskRecord) -> Result<TaskRecord, EngineError>;

    /// `save_stage(parent)` + `insert(child)` atomically.
    async fn spawn_child(
        &self,
        parent: &TaskRecord,
        child: &TaskRecord,
    ) -> Result<TaskRecord, EngineError>;

    /// Every record with status pending or running, oldest first.
    async fn list_resumable(&self) -> Result<Vec<TaskRecord>, EngineError>;

    /// Oldest first.
    async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, EngineError>;

    async fn stage_history(&self, id: TaskId) -> Result<Vec<StageEntry>, EngineError>;
}
