//! State machine transitions applied on behalf of handlers and operators.
//!
//! - advance: 次の stage へ（pending に戻して再投入）
//! - terminate: complete / failed（冪等。2 回目以降は何もしない）
//!
//! 終端遷移が実際に書き込まれたときだけ副作用（リソースステータス反映、
//! 監査、親タスクの継続）が走ります。

use tracing::{debug, error, info, warn};

use crate::domain::audit::actions;
use crate::domain::{AuditEntry, AuditOutcome, EngineError, Payload, TaskRecord, TaskStatus};
use crate::typed::DynWorkflow;

use super::services::Services;
use super::subtask;

/// Persist `stage` as the next pending stage. `Ok(None)` when the record
/// turned terminal meanwhile.
///
/// On a reload after a conflict the handler's payload is merged over the
/// stored one, so flags written concurrently (cancel requests) survive.
pub(crate) async fn advance(
    services: &Services,
    record: TaskRecord,
    stage: &str,
    payload: Payload,
) -> Result<Option<TaskRecord>, EngineError> {
    let now = services.clock.now();
    let claimed_version = record.version;
    services
        .update_with_retry(record, |r| {
            if r.is_terminal() {
                return Ok(false);
            }
            let next_payload = if r.version == claimed_version {
                payload.clone()
            } else {
                let mut merged = r.payload.clone();
                merged.merge(payload.clone());
                merged
            };
            r.advance(stage, next_payload, now)?;
            Ok(true)
        })
        .await
}

/// Move the record to `status` (complete or failed).
///
/// Returns the stored record when this call performed the transition and
/// `Ok(None)` when the record was already terminal.
pub(crate) async fn terminate(
    services: &Services,
    workflow: Option<&dyn DynWorkflow>,
    record: TaskRecord,
    status: TaskStatus,
    payload: Payload,
) -> Result<Option<TaskRecord>, EngineError> {
    let now = services.clock.now();
    let id = record.id;
    let saved = services
        .update_with_retry(record, |r| {
            if r.is_terminal() {
                return Ok(false);
            }
            r.finish(status, payload.clone(), now)?;
            Ok(true)
        })
        .await?;

    let Some(saved) = saved else {
        debug!(task_id = %id, "already terminal, nothing to do");
        return Ok(None);
    };

    let reason = saved.payload.failure_reason().unwrap_or_default().to_string();
    info!(
        task_id = %saved.id,
        type_name = %saved.type_name,
        target = %saved.target,
        status = %saved.status,
        reason = %reason,
        "task finished"
    );

    reconcile_status(services, workflow, &saved, &reason).await;

    let (action, outcome, detail) = match status {
        TaskStatus::Complete => (actions::TASK_COMPLETE, AuditOutcome::Success, "complete".to_string()),
        _ => (actions::TASK_FAILED, AuditOutcome::Failure, reason),
    };
    services
        .audit(AuditEntry::new(&saved.actor, &saved.target, action, outcome, detail, now).for_task(saved.id))
        .await;

    // 親の継続に失敗しても子の終端は確定済み。起動時の resume で回収される。
    if let Err(e) = subtask::continue_parent(services, &saved).await {
        error!(task_id = %saved.id, error = %e, "failed to continue parent");
    }

    Ok(Some(saved))
}

/// Write the workflow's terminal status onto the resource, only when it differs
/// from what the resource already shows.
async fn reconcile_status(
    services: &Services,
    workflow: Option<&dyn DynWorkflow>,
    record: &TaskRecord,
    reason: &str,
) {
    let desired = match (record.status, workflow) {
        (TaskStatus::Complete, Some(w)) => w.complete_status(),
        (TaskStatus::Complete, None) => None,
        (_, Some(w)) => w.failed_status(),
        (_, None) => Some(TaskStatus::Failed.as_str()),
    };
    let Some(desired) = desired else {
        return;
    };

    let resource = match services.resources.resolve(&record.target).await {
        Ok(Some(resource)) => resource,
        Ok(None) => {
            debug!(target = %record.target, "resource gone, skipping status reconcile");
            return;
        }
        Err(e) => {
            warn!(target = %record.target, error = %e, "resolve failed during status reconcile");
            return;
        }
    };
    if resource.status == desired {
        return;
    }

    if let Err(e) = services
        .resources
        .set_status(&record.target, &record.actor, desired, reason)
        .await
    {
        warn!(target = %record.target, status = desired, error = %e, "set_status failed");
        return;
    }
    let entry = AuditEntry::new(
        &record.actor,
        &record.target,
        actions::STATUS_UPDATE,
        AuditOutcome::Success,
        format!("{} -> {desired}", resource.status),
        services.clock.now(),
    )
    .for_task(record.id);
    services.audit(entry).await;
}
