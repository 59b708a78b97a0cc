//! Audit records and stage history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::actor::Actor;
use super::ids::TaskId;
use super::record::TaskRecord;
use super::status::TaskStatus;
use super::target::TargetRef;

pub mod actions {
    pub const TASK_COMPLETE: &str = "task.complete";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TARGET_GONE: &str = "task.target_gone";
    pub const REMOTE_ATTEMPT: &str = "remote.attempt";
    pub const DEADLINE_EXCEEDED: &str = "stage.deadline_exceeded";
    pub const STATUS_UPDATE: &str = "resource.status";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Warning,
}

/// `Record(actor, resource_ref, action, outcome, detail)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor: Actor,
    pub target: TargetRef,
    pub task_id: Option<TaskId>,
    pub action: String,
    pub outcome: AuditOutcome,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor: &Actor,
        target: &TargetRef,
        action: &str,
        outcome: AuditOutcome,
        detail: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            actor: actor.clone(),
            target: target.clone(),
            task_id: None,
            action: action.to_string(),
            outcome,
            detail: detail.into(),
            at,
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// One row of stage history, appended on every `SaveStage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub task_id: TaskId,
    pub stage: String,
    pub status: TaskStatus,
    pub actor_id: String,
    pub at: DateTime<Utc>,
}

impl StageEntry {
    /// The row a store appends when it persists `record`.
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id,
            stage: record.stage.clone(),
            status: record.status,
            actor_id: record.actor.user_id.clone(),
            at: record.updated_at,
        }
    }
}
