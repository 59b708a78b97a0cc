//! Subtask chaining - 親子タスクの連結
//!
//! - spawn_child: 子の作成と親の待機状態への遷移を 1 回の書き込みで行う
//! - continue_parent: 子の終端後、親を継続 stage に進める（ちょうど 1 回）

use tracing::{debug, info};

use crate::domain::stage::{on_complete, on_complete_failed};
use crate::domain::{Continuation, EngineError, NewTask, Payload, TargetRef, TaskId, TaskRecord};

use super::services::Services;

/// What a handler asks for when it starts a child.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskRequest {
    pub type_name: String,
    pub target: TargetRef,
    pub on_complete: String,
    pub on_fail: String,
    pub payload: Payload,
}

impl SubtaskRequest {
    /// Continuations named after `purpose`: `On{purpose}Complete` / `On{purpose}CompleteFailed`.
    pub fn new(type_name: impl Into<String>, target: TargetRef, purpose: &str) -> Self {
        Self {
            type_name: type_name.into(),
            target,
            on_complete: on_complete(purpose),
            on_fail: on_complete_failed(purpose),
            payload: Payload::new(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_continuations(mut self, on_complete: &str, on_fail: &str) -> Self {
        self.on_complete = on_complete.to_string();
        self.on_fail = on_fail.to_string();
        self
    }
}

/// Park `parent` at the waiting marker and insert the child atomically.
/// `Ok(None)` when the parent turned terminal meanwhile (no child is created).
pub(crate) async fn spawn_child(
    services: &Services,
    mut parent: TaskRecord,
    child_id: TaskId,
    request: SubtaskRequest,
    parent_payload: Payload,
) -> Result<Option<TaskRecord>, EngineError> {
    let workflow = services
        .registry
        .get(&request.type_name)
        .ok_or_else(|| EngineError::UnknownTaskType(request.type_name.clone()))?;

    let now = services.clock.now();
    let task = NewTask::new(request.type_name, request.target, parent.actor.clone())
        .with_payload(request.payload)
        .with_parent(parent.id);
    let child = TaskRecord::new(child_id, task, workflow.initial_stage(), now).with_continuation(
        Continuation {
            on_complete: request.on_complete,
            on_fail: request.on_fail,
        },
    );

    let claimed_version = parent.version;
    let mut conflicts = 0;
    loop {
        if parent.is_terminal() {
            return Ok(None);
        }
        let payload = if parent.version == claimed_version {
            parent_payload.clone()
        } else {
            let mut merged = parent.payload.clone();
            merged.merge(parent_payload.clone());
            merged
        };
        let mut waiting = parent.clone();
        waiting.wait_for_child(child_id, payload, now)?;

        match services.store.spawn_child(&waiting, &child).await {
            Ok(saved) => {
                info!(
                    parent_id = %saved.id,
                    child_id = %child_id,
                    child_type = %child.type_name,
                    target = %child.target,
                    "started subtask"
                );
                return Ok(Some(saved));
            }
            Err(e) if e.is_conflict() && conflicts < services.config.conflict_retries => {
                conflicts += 1;
                debug!(task_id = %parent.id, conflicts, "version conflict, reloading parent");
                parent = services.store.load(parent.id).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fire the parent's continuation for a child that just reached a terminal
/// state, copying the child's payload under `child_result`.
///
/// The parent only moves if it is still waiting on this very child, so a
/// second call for the same child is a no-op.
pub(crate) async fn continue_parent(services: &Services, child: &TaskRecord) -> Result<(), EngineError> {
    let (Some(parent_id), Some(continuation)) = (child.parent_id, child.continuation.as_ref()) else {
        return Ok(());
    };
    if !child.is_terminal() {
        return Ok(());
    }

    let parent = services.store.load(parent_id).await?;
    let stage = continuation.stage_for(child.status).to_string();
    let child_id = child.id;
    let child_result = child.payload.clone();
    let now = services.clock.now();

    let resumed = services
        .update_with_retry(parent, |p| {
            if p.is_terminal() || p.waiting_on != Some(child_id) {
                return Ok(false);
            }
            p.resume_from_child(&stage, child_result.clone(), now)?;
            Ok(true)
        })
        .await?;

    match resumed {
        Some(parent) => {
            info!(
                parent_id = %parent.id,
                child_id = %child_id,
                stage = %parent.stage,
                "continuing parent"
            );
            services.queue.push(parent.id).await?;
        }
        None => debug!(parent_id = %parent_id, child_id = %child_id, "parent not waiting on this child"),
    }
    Ok(())
}
