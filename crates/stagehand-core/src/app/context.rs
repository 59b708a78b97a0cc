//! StageContext - stage handler に渡される実行コンテキスト
//!
//! handler は以下のいずれか 1 つで stage を抜けます:
//! - set_stage(next, data)
//! - set_stage_complete(data) / set_stage_failed(data)
//! - start_subtask(...)
//!
//! 遷移はここでは記録するだけで、永続化と再投入は handler が戻った後に
//! Dispatcher が行います。

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::EngineConfig;
use crate::domain::audit::actions;
use crate::domain::payload::REASON_KEY;
use crate::domain::{
    Actor, AuditEntry, AuditOutcome, EngineError, Payload, RemoteError, TargetRef, TaskId, TaskRecord,
};
use crate::ports::Resource;
use crate::retry::{AttemptReport, RetryError, with_retry_observed};
use crate::typed::DynWorkflow;

use super::services::Services;
use super::subtask::SubtaskRequest;

/// The single transition a handler requested.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Next(String),
    Complete,
    Failed,
    Subtask { child_id: TaskId, request: SubtaskRequest },
}

pub struct StageContext {
    record: TaskRecord,
    resource: Resource,
    payload: Payload,
    transition: Option<Transition>,
    workflow: Arc<dyn DynWorkflow>,
    services: Arc<Services>,
}

impl StageContext {
    pub(crate) fn new(
        record: TaskRecord,
        resource: Resource,
        workflow: Arc<dyn DynWorkflow>,
        services: Arc<Services>,
    ) -> Self {
        let payload = record.payload.clone();
        Self {
            record,
            resource,
            payload,
            transition: None,
            workflow,
            services,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.record.id
    }

    pub fn type_name(&self) -> &str {
        &self.record.type_name
    }

    pub fn stage(&self) -> &str {
        &self.record.stage
    }

    pub fn parent_id(&self) -> Option<TaskId> {
        self.record.parent_id
    }

    pub fn actor(&self) -> &Actor {
        &self.record.actor
    }

    pub fn target(&self) -> &TargetRef {
        &self.record.target
    }

    /// Resource snapshot resolved right before this dispatch.
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.payload.is_cancel_requested()
    }

    pub fn transition(&self) -> Option<&Transition> {
        self.transition.as_ref()
    }

    fn request(&mut self, transition: Transition) -> Result<(), EngineError> {
        if let Some(existing) = &self.transition {
            return Err(EngineError::invalid_transition(
                self.record.type_name.as_str(),
                format!(
                    "stage {} already requested {existing:?}, cannot also request {transition:?}",
                    self.record.stage
                ),
            ));
        }
        debug!(task_id = %self.record.id, stage = %self.record.stage, ?transition, "transition requested");
        self.transition = Some(transition);
        Ok(())
    }

    fn absorb(&mut self, data: Option<Payload>) {
        if let Some(data) = data {
            self.payload.merge(data);
        }
    }

    /// Continue at `next`. Fails with `InvalidTransition` when the workflow
    /// has no handler for it.
    pub fn set_stage(&mut self, next: &str, data: Option<Payload>) -> Result<(), EngineError> {
        if !self.workflow.has_stage(next) {
            return Err(EngineError::invalid_transition(
                self.record.type_name.as_str(),
                format!("no handler for stage '{next}'"),
            ));
        }
        self.request(Transition::Next(next.to_string()))?;
        self.absorb(data);
        Ok(())
    }

    pub fn set_stage_complete(&mut self, data: Option<Payload>) -> Result<(), EngineError> {
        self.request(Transition::Complete)?;
        self.absorb(data);
        Ok(())
    }

    /// `data` should carry a human-readable `reason`.
    pub fn set_stage_failed(&mut self, data: Option<Payload>) -> Result<(), EngineError> {
        self.request(Transition::Failed)?;
        self.absorb(data);
        Ok(())
    }

    /// `set_stage_failed` with just a reason.
    pub fn fail(&mut self, reason: impl std::fmt::Display) -> Result<(), EngineError> {
        let data = Payload::new().with(REASON_KEY, reason.to_string());
        self.set_stage_failed(Some(data))
    }

    /// Start a child whose continuations follow the `On{purpose}Complete` /
    /// `On{purpose}CompleteFailed` convention.
    pub async fn start_subtask(
        &mut self,
        type_name: &str,
        target: TargetRef,
        purpose: &str,
        payload: Payload,
    ) -> Result<TaskId, EngineError> {
        let request = SubtaskRequest::new(type_name, target, purpose).with_payload(payload);
        self.start_subtask_with(request).await
    }

    pub async fn start_subtask_with(&mut self, request: SubtaskRequest) -> Result<TaskId, EngineError> {
        if !self.services.registry.contains(&request.type_name) {
            return Err(EngineError::UnknownTaskType(request.type_name));
        }
        for stage in [&request.on_complete, &request.on_fail] {
            if !self.workflow.has_stage(stage) {
                return Err(EngineError::invalid_transition(
                    self.record.type_name.as_str(),
                    format!("continuation stage '{stage}' has no handler"),
                ));
            }
        }
        if self.services.resources.resolve(&request.target).await?.is_none() {
            return Err(EngineError::InvalidTarget {
                target: request.target.to_string(),
                reason: "resource not found".into(),
            });
        }

        let child_id = self.services.ids.generate_task_id();
        self.request(Transition::Subtask { child_id, request })?;
        Ok(child_id)
    }

    /// Publish an in-progress status on the target resource (e.g. `applying`).
    pub async fn set_resource_status(&mut self, status: &str, reason: &str) -> Result<(), EngineError> {
        self.services
            .resources
            .set_status(&self.record.target, &self.record.actor, status, reason)
            .await?;
        let detail = format!("{} -> {status}", self.resource.status);
        self.resource.status = status.to_string();
        let entry = AuditEntry::new(
            &self.record.actor,
            &self.record.target,
            actions::STATUS_UPDATE,
            AuditOutcome::Success,
            detail,
            self.services.clock.now(),
        )
        .for_task(self.record.id);
        self.services.audit(entry).await;
        Ok(())
    }

    /// Record a workflow-level action (e.g. `update_tags`) against this task's target.
    pub async fn audit(&self, action: &str, outcome: AuditOutcome, detail: impl Into<String>) {
        let entry = AuditEntry::new(
            &self.record.actor,
            &self.record.target,
            action,
            outcome,
            detail,
            self.services.clock.now(),
        )
        .for_task(self.record.id);
        self.services.audit(entry).await;
    }

    /// Run an external call through the retry helper with the engine's policy.
    /// Every attempt is audited under `remote.attempt`, stamped when it finished.
    pub async fn retry<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, RemoteError>> + Send,
        T: Send,
    {
        let clock = &self.services.clock;
        let mut reports: Vec<(DateTime<Utc>, AttemptReport)> = Vec::new();
        let result = with_retry_observed(
            &self.services.config.retry,
            operation,
            |report| reports.push((clock.now(), report)),
            f,
        )
        .await;

        for (at, report) in reports {
            let (outcome, detail) = match &report.error {
                None => (
                    AuditOutcome::Success,
                    format!("{operation}: attempt {}/{} ok", report.attempt, report.max_attempts),
                ),
                Some(err) => (
                    AuditOutcome::Failure,
                    format!(
                        "{operation}: attempt {}/{} failed: {err}",
                        report.attempt, report.max_attempts
                    ),
                ),
            };
            let entry = AuditEntry::new(
                &self.record.actor,
                &self.record.target,
                actions::REMOTE_ATTEMPT,
                outcome,
                detail,
                at,
            )
            .for_task(self.record.id);
            self.services.audit(entry).await;
        }
        result
    }

    pub(crate) fn into_parts(self) -> (Payload, Option<Transition>) {
        (self.payload, self.transition)
    }
}
