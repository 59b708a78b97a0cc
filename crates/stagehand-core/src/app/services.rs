//! Services - エンジンが共有する依存関係の束
//!
//! Engine / Dispatcher / StageContext はすべて `Arc<Services>` を通して
//! ポートにアクセスします。

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::domain::{AuditEntry, EngineError, TaskRecord};
use crate::ports::{AuditSink, Clock, IdGenerator, ReadyQueue, ResourceLock, ResourceProvider, TaskStore};
use crate::typed::TaskRegistry;

pub(crate) struct Services {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<dyn ReadyQueue>,
    pub registry: Arc<TaskRegistry>,
    pub resources: Arc<dyn ResourceProvider>,
    pub locks: Arc<dyn ResourceLock>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub config: EngineConfig,
}

impl Services {
    /// Fire-and-forget: a failing sink never fails the task.
    pub async fn audit(&self, entry: AuditEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.audit.record(entry).await {
            warn!(action = %action, error = %e, "audit sink failed");
        }
    }

    /// Apply `mutate` and compare-and-set, reloading on `Conflict` up to
    /// `conflict_retries` times.
    ///
    /// `mutate` returns `Ok(false)` when there is nothing to write any more
    /// (for example the record turned terminal meanwhile); that yields `Ok(None)`.
    pub async fn update_with_retry<F>(
        &self,
        mut record: TaskRecord,
        mut mutate: F,
    ) -> Result<Option<TaskRecord>, EngineError>
    where
        F: FnMut(&mut TaskRecord) -> Result<bool, EngineError> + Send,
    {
        let mut conflicts = 0;
        loop {
            let mut next = record.clone();
            if !mutate(&mut next)? {
                return Ok(None);
            }
            match self.store.save_stage(&next).await {
                Ok(saved) => return Ok(Some(saved)),
                Err(e) if e.is_conflict() && conflicts < self.config.conflict_retries => {
                    conflicts += 1;
                    debug!(task_id = %record.id, conflicts, "version conflict, reloading");
                    record = self.store.load(record.id).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
