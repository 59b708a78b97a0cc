//! Task record: the unit of persisted work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::actor::Actor;
use super::errors::EngineError;
use super::ids::TaskId;
use super::payload::{CHILD_RESULT_KEY, Payload};
use super::stage::{COMPLETE_STAGE, FAILED_STAGE, WAITING_FOR_CHILD};
use super::status::TaskStatus;
use super::target::TargetRef;

/// Stages to run on the parent once this child terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub on_complete: String,
    pub on_fail: String,
}

impl Continuation {
    pub fn stage_for(&self, child_status: TaskStatus) -> &str {
        if child_status == TaskStatus::Complete {
            &self.on_complete
        } else {
            &self.on_fail
        }
    }
}

/// Input for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub type_name: String,
    pub target: TargetRef,
    pub actor: Actor,
    pub payload: Payload,
    pub parent_id: Option<TaskId>,
}

impl NewTask {
    pub fn new(type_name: impl Into<String>, target: TargetRef, actor: Actor) -> Self {
        Self {
            type_name: type_name.into(),
            target,
            actor,
            payload: Payload::new(),
            parent_id: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// Single source of truth for a task.
///
/// All state changes go through the methods below; stores persist whatever
/// the record holds and compare-and-set on `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub type_name: String,
    pub target: TargetRef,
    pub parent_id: Option<TaskId>,

    /// Set on children created through `start_subtask`.
    pub continuation: Option<Continuation>,

    /// Set on a parent while it is parked at `WAITING_FOR_CHILD`.
    pub waiting_on: Option<TaskId>,

    pub stage: String,
    pub payload: Payload,
    pub status: TaskStatus,
    pub actor: Actor,

    /// Bumped by the store on every successful save.
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId, task: NewTask, initial_stage: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            type_name: task.type_name,
            target: task.target,
            parent_id: task.parent_id,
            continuation: None,
            waiting_on: None,
            stage: initial_stage.to_string(),
            payload: task.payload,
            status: TaskStatus::Pending,
            actor: task.actor,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = Some(continuation);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_waiting(&self) -> bool {
        self.stage == WAITING_FOR_CHILD
    }

    fn ensure_mutable(&self) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(EngineError::invalid_transition(
                &self.type_name,
                format!("{} is already {}", self.id, self.status),
            ));
        }
        Ok(())
    }

    /// Pending -> Running at the current stage.
    pub fn start_dispatch(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.ensure_mutable()?;
        if self.is_waiting() {
            return Err(EngineError::invalid_transition(
                &self.type_name,
                format!("{} is waiting for a child", self.id),
            ));
        }
        self.status = TaskStatus::Running;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `stage` and wait for the scheduler.
    pub fn advance(&mut self, stage: &str, payload: Payload, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.ensure_mutable()?;
        self.stage = stage.to_string();
        self.payload = payload;
        self.status = TaskStatus::Pending;
        self.updated_at = now;
        Ok(())
    }

    /// Park until `child` terminates.
    pub fn wait_for_child(&mut self, child: TaskId, payload: Payload, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.advance(WAITING_FOR_CHILD, payload, now)?;
        self.waiting_on = Some(child);
        Ok(())
    }

    /// Leave the waiting marker for the continuation stage.
    pub fn resume_from_child(
        &mut self,
        stage: &str,
        child_result: Payload,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut payload = self.payload.clone();
        payload.set(CHILD_RESULT_KEY, child_result.to_value());
        self.advance(stage, payload, now)?;
        self.waiting_on = None;
        Ok(())
    }

    /// Enter a terminal state. Caller checks `is_terminal` first for idempotence.
    pub fn finish(&mut self, status: TaskStatus, payload: Payload, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.ensure_mutable()?;
        self.stage = match status {
            TaskStatus::Complete => COMPLETE_STAGE.to_string(),
            TaskStatus::Failed => FAILED_STAGE.to_string(),
            other => {
                return Err(EngineError::invalid_transition(
                    &self.type_name,
                    format!("{other} is not a terminal status"),
                ));
            }
        };
        self.status = status;
        self.payload = payload;
        self.waiting_on = None;
        self.updated_at = now;
        Ok(())
    }
}
