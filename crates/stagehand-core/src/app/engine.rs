//! Engine - 呼び出し側から見た窓口
//!
//! - create_task / dispatch / resume
//! - complete_task / fail_task / request_cancel（運用者向け）
//! - query / stage_history / wait_for_terminal（読み取り専用）
//! - start() でワーカープールを起動

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::domain::payload::CANCEL_KEY;
use crate::domain::{EngineError, NewTask, Payload, StageEntry, TaskId, TaskRecord, TaskStatus};
use crate::ports::TaskQuery;
use crate::typed::TaskRegistry;

use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::scheduler::Scheduler;
use super::services::Services;
use super::{subtask, transitions};

const WAIT_POLL: Duration = Duration::from_millis(10);

pub struct Engine {
    services: Arc<Services>,
    dispatcher: Arc<Dispatcher>,
}

impl Engine {
    pub(crate) fn new(services: Services) -> Self {
        let services = Arc::new(services);
        let dispatcher = Arc::new(Dispatcher::new(services.clone()));
        Self { services, dispatcher }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.services.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Persist a new pending task at its workflow's initial stage and enqueue it.
    pub async fn create_task(&self, task: NewTask) -> Result<TaskId, EngineError> {
        let services = &self.services;
        let workflow = services
            .registry
            .get(&task.type_name)
            .ok_or_else(|| EngineError::UnknownTaskType(task.type_name.clone()))?;

        if services.resources.resolve(&task.target).await?.is_none() {
            return Err(EngineError::InvalidTarget {
                target: task.target.to_string(),
                reason: "resource not found".into(),
            });
        }
        if let Some(parent_id) = task.parent_id {
            let parent = services.store.load(parent_id).await?;
            if parent.is_terminal() {
                return Err(EngineError::invalid_transition(
                    parent.type_name.as_str(),
                    format!("parent {parent_id} is already {}", parent.status),
                ));
            }
        }

        let id = services.ids.generate_task_id();
        let record = TaskRecord::new(id, task, workflow.initial_stage(), services.clock.now());
        services.store.insert(&record).await?;
        services.queue.push(id).await?;
        info!(
            task_id = %id,
            type_name = %record.type_name,
            target = %record.target,
            actor = %record.actor,
            "task created"
        );
        Ok(id)
    }

    pub async fn load(&self, id: TaskId) -> Result<TaskRecord, EngineError> {
        self.services.store.load(id).await
    }

    /// Run one stage of `id` on the calling task (no worker pool needed).
    pub async fn dispatch(&self, id: TaskId) -> Result<DispatchOutcome, EngineError> {
        self.dispatcher.dispatch(id).await
    }

    /// Startup recovery: enqueue every pending or running record at its
    /// persisted stage. Parents parked on a child that already finished get
    /// their continuation; parents waiting on a live child stay parked.
    ///
    /// Returns the number of records enqueued.
    pub async fn resume(&self) -> Result<usize, EngineError> {
        let services = &self.services;
        let mut enqueued = 0;
        for record in services.store.list_resumable().await? {
            if !record.is_waiting() {
                services.queue.push(record.id).await?;
                enqueued += 1;
                continue;
            }
            let Some(child_id) = record.waiting_on else {
                continue;
            };
            let child = services.store.load(child_id).await?;
            if child.is_terminal() {
                debug!(parent_id = %record.id, child_id = %child_id, "child finished while down");
                subtask::continue_parent(services, &child).await?;
                enqueued += 1;
            }
        }
        info!(enqueued, "resumed in-flight tasks");
        Ok(enqueued)
    }

    /// Operator completion. Idempotent: a terminal record is left untouched.
    pub async fn complete_task(&self, id: TaskId, data: Option<Payload>) -> Result<TaskRecord, EngineError> {
        self.terminate(id, TaskStatus::Complete, data).await
    }

    /// Operator failure with a reason. Idempotent like `complete_task`.
    pub async fn fail_task(&self, id: TaskId, reason: &str) -> Result<TaskRecord, EngineError> {
        self.terminate(id, TaskStatus::Failed, Some(Payload::reason(reason)))
            .await
    }

    async fn terminate(
        &self,
        id: TaskId,
        status: TaskStatus,
        data: Option<Payload>,
    ) -> Result<TaskRecord, EngineError> {
        let record = self.services.store.load(id).await?;
        if record.is_terminal() {
            return Ok(record);
        }
        let workflow = self.services.registry.get(&record.type_name);
        let mut payload = record.payload.clone();
        if let Some(data) = data {
            payload.merge(data);
        }
        match transitions::terminate(&self.services, workflow.as_deref(), record, status, payload).await? {
            Some(saved) => Ok(saved),
            None => self.services.store.load(id).await,
        }
    }

    /// Ask a running workflow to stop at its next check. There is no preemption.
    /// Returns `false` when the task is already terminal.
    pub async fn request_cancel(&self, id: TaskId) -> Result<bool, EngineError> {
        let record = self.services.store.load(id).await?;
        let now = self.services.clock.now();
        let saved = self
            .services
            .update_with_retry(record, |r| {
                if r.is_terminal() {
                    return Ok(false);
                }
                r.payload.set(CANCEL_KEY, true);
                r.updated_at = now;
                Ok(true)
            })
            .await?;
        if saved.is_some() {
            info!(task_id = %id, "cancel requested");
        }
        Ok(saved.is_some())
    }

    pub async fn query(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, EngineError> {
        self.services.store.query(query).await
    }

    pub async fn stage_history(&self, id: TaskId) -> Result<Vec<StageEntry>, EngineError> {
        self.services.store.stage_history(id).await
    }

    /// Poll until `id` is terminal. `Ok(None)` on timeout.
    pub async fn wait_for_terminal(
        &self,
        id: TaskId,
        timeout: Duration,
    ) -> Result<Option<TaskRecord>, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self.services.store.load(id).await?;
            if record.is_terminal() {
                return Ok(Some(record));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Spawn `config.workers` workers pulling from the ready queue.
    pub fn start(&self) -> Scheduler {
        Scheduler::spawn(
            self.services.config.workers,
            self.services.clone(),
            self.dispatcher.clone(),
        )
    }
}
