//! Dispatcher - 1 回の stage 実行
//!
//! dispatch(task_id) の流れ:
//! 1. 同じ task_id の並行 dispatch を排除（in-flight ガード）
//! 2. Task Record を読み込み、終端・子待ちならスキップ
//! 3. target_ref のロックを取得（取れなければ Requeue）
//! 4. リソースを解決（消えていれば TargetGone で失敗）
//! 5. running を CAS で確定
//! 6. handler を panic 捕捉付きで実行（soft deadline 超過は監査のみ）
//! 7. 要求された遷移を永続化し、ロックを解放してから次を投入

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::domain::audit::actions;
use crate::domain::{AuditEntry, AuditOutcome, EngineError, Payload, TaskId, TaskRecord, TaskStatus};
use crate::ports::Resource;
use crate::typed::DynWorkflow;

use super::context::{StageContext, Transition};
use super::services::Services;
use super::{subtask, transitions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Moved to another stage and re-enqueued.
    Advanced,
    Completed,
    Failed,
    /// Started a child; the parent is parked.
    WaitingForChild,
    /// Target locked by another task; offer the task again later.
    Requeue,
    /// Nothing to run (terminal, waiting, or already being dispatched).
    Skipped,
}

/// Removes the task id from the in-flight set on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<TaskId>>,
    id: TaskId,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a Mutex<HashSet<TaskId>>, id: TaskId) -> Option<Self> {
        let inserted = set.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
        inserted.then_some(Self { set, id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub(crate) struct Dispatcher {
    services: Arc<Services>,
    in_flight: Mutex<HashSet<TaskId>>,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub async fn dispatch(&self, task_id: TaskId) -> Result<DispatchOutcome, EngineError> {
        let (outcome, follow_up) = {
            let Some(_guard) = InFlight::enter(&self.in_flight, task_id) else {
                debug!(task_id = %task_id, "already in flight, skipping duplicate");
                return Ok(DispatchOutcome::Skipped);
            };
            self.dispatch_exclusive(task_id).await?
        };

        // ロックと in-flight を手放してから投入する（永続化は確定済み）
        if let Some(next) = follow_up {
            self.services.queue.push(next).await?;
        }
        Ok(outcome)
    }

    async fn dispatch_exclusive(
        &self,
        task_id: TaskId,
    ) -> Result<(DispatchOutcome, Option<TaskId>), EngineError> {
        let services = &self.services;
        let record = services.store.load(task_id).await?;
        if record.is_terminal() || record.is_waiting() {
            debug!(task_id = %task_id, stage = %record.stage, status = %record.status, "nothing to dispatch");
            return Ok((DispatchOutcome::Skipped, None));
        }

        let Some(workflow) = services.registry.get(&record.type_name) else {
            let err = EngineError::UnknownTaskType(record.type_name.clone());
            self.fail(None, record, &err).await?;
            return Ok((DispatchOutcome::Failed, None));
        };
        if !workflow.has_stage(&record.stage) {
            let err = EngineError::invalid_transition(
                record.type_name.as_str(),
                format!("no handler for stage '{}'", record.stage),
            );
            self.fail(Some(workflow.as_ref()), record, &err).await?;
            return Ok((DispatchOutcome::Failed, None));
        }

        let target = record.target.clone();
        if !services.locks.try_acquire(&target, task_id).await? {
            debug!(task_id = %task_id, target = %target, "target locked, requeueing");
            return Ok((DispatchOutcome::Requeue, None));
        }

        let result = self.run_locked(workflow, record).await;

        if let Err(e) = services.locks.release(&target, task_id).await {
            warn!(task_id = %task_id, target = %target, error = %e, "failed to release target lock");
        }
        result
    }

    async fn run_locked(
        &self,
        workflow: Arc<dyn DynWorkflow>,
        record: TaskRecord,
    ) -> Result<(DispatchOutcome, Option<TaskId>), EngineError> {
        let services = &self.services;

        let resource = match services.resources.resolve(&record.target).await? {
            Some(resource) => resource,
            None => {
                let err = EngineError::TargetGone(record.target.clone());
                let entry = AuditEntry::new(
                    &record.actor,
                    &record.target,
                    actions::TARGET_GONE,
                    AuditOutcome::Failure,
                    err.to_string(),
                    services.clock.now(),
                )
                .for_task(record.id);
                services.audit(entry).await;
                self.fail(Some(workflow.as_ref()), record, &err).await?;
                return Ok((DispatchOutcome::Failed, None));
            }
        };

        let Some(claimed) = self.claim(record).await? else {
            return Ok((DispatchOutcome::Skipped, None));
        };
        info!(
            task_id = %claimed.id,
            type_name = %claimed.type_name,
            stage = %claimed.stage,
            target = %claimed.target,
            "dispatching stage"
        );

        let (payload, outcome) = self.invoke(workflow.clone(), &claimed, resource).await;

        match outcome {
            Ok(Transition::Next(stage)) => {
                match transitions::advance(services, claimed, &stage, payload).await? {
                    Some(saved) => Ok((DispatchOutcome::Advanced, Some(saved.id))),
                    None => Ok((DispatchOutcome::Skipped, None)),
                }
            }
            Ok(Transition::Complete) => {
                transitions::terminate(services, Some(workflow.as_ref()), claimed, TaskStatus::Complete, payload)
                    .await?;
                Ok((DispatchOutcome::Completed, None))
            }
            Ok(Transition::Failed) => {
                transitions::terminate(services, Some(workflow.as_ref()), claimed, TaskStatus::Failed, payload)
                    .await?;
                Ok((DispatchOutcome::Failed, None))
            }
            Ok(Transition::Subtask { child_id, request }) => {
                match subtask::spawn_child(services, claimed, child_id, request, payload).await? {
                    Some(_) => Ok((DispatchOutcome::WaitingForChild, Some(child_id))),
                    None => Ok((DispatchOutcome::Skipped, None)),
                }
            }
            Err(err) => {
                let mut failed = payload;
                failed.set(crate::domain::payload::REASON_KEY, err.to_string());
                transitions::terminate(services, Some(workflow.as_ref()), claimed, TaskStatus::Failed, failed)
                    .await?;
                Ok((DispatchOutcome::Failed, None))
            }
        }
    }

    /// Persist `running` for the current stage. `Ok(None)` when the record
    /// moved on meanwhile.
    ///
    /// The caller holds both the in-flight slot and the target lock, so a
    /// `running` record seen here was left behind by an earlier dispatch
    /// that never saved its transition. It is claimed again.
    async fn claim(&self, record: TaskRecord) -> Result<Option<TaskRecord>, EngineError> {
        let now = self.services.clock.now();
        let stage = record.stage.clone();
        self.services
            .update_with_retry(record, |r| {
                if r.is_terminal() || r.is_waiting() || r.stage != stage {
                    return Ok(false);
                }
                r.start_dispatch(now)?;
                Ok(true)
            })
            .await
    }

    /// Run the handler with fault isolation and the soft deadline.
    /// Returns the handler's working payload and the requested transition.
    async fn invoke(
        &self,
        workflow: Arc<dyn DynWorkflow>,
        claimed: &TaskRecord,
        resource: Resource,
    ) -> (Payload, Result<Transition, EngineError>) {
        let services = &self.services;
        let mut ctx = StageContext::new(claimed.clone(), resource, workflow.clone(), services.clone());

        let result = {
            let Some(future) = workflow.run_stage(&claimed.stage, &mut ctx) else {
                let err = EngineError::invalid_transition(
                    claimed.type_name.as_str(),
                    format!("no handler for stage '{}'", claimed.stage),
                );
                return (claimed.payload.clone(), Err(err));
            };
            let guarded = AssertUnwindSafe(future).catch_unwind();
            tokio::pin!(guarded);

            let deadline = services.config.stage_soft_deadline();
            let first = tokio::time::timeout(deadline, &mut guarded).await;
            match first {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        task_id = %claimed.id,
                        stage = %claimed.stage,
                        deadline_ms = deadline.as_millis() as u64,
                        "stage exceeded its soft deadline"
                    );
                    let entry = AuditEntry::new(
                        &claimed.actor,
                        &claimed.target,
                        actions::DEADLINE_EXCEEDED,
                        AuditOutcome::Warning,
                        format!("stage {} still running after {}ms", claimed.stage, deadline.as_millis()),
                        services.clock.now(),
                    )
                    .for_task(claimed.id);
                    services.audit(entry).await;
                    guarded.await
                }
            }
        };

        let (payload, transition) = ctx.into_parts();
        let outcome = match result {
            Err(panic) => Err(EngineError::HandlerFault(format!(
                "stage {} panicked: {}",
                claimed.stage,
                panic_message(panic.as_ref())
            ))),
            Ok(Err(err)) => Err(err),
            Ok(Ok(())) => transition.ok_or_else(|| {
                EngineError::HandlerFault(format!("stage {} returned without a transition", claimed.stage))
            }),
        };
        if let Err(err) = &outcome {
            warn!(task_id = %claimed.id, stage = %claimed.stage, error = %err, "stage handler failed");
        }
        (payload, outcome)
    }

    /// Fail a record the dispatcher cannot run at all.
    async fn fail(
        &self,
        workflow: Option<&dyn DynWorkflow>,
        record: TaskRecord,
        err: &EngineError,
    ) -> Result<(), EngineError> {
        warn!(task_id = %record.id, error = %err, "failing task before dispatch");
        let mut payload = record.payload.clone();
        payload.merge(Payload::reason(err.to_string()));
        transitions::terminate(&self.services, workflow, record, TaskStatus::Failed, payload).await?;
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
