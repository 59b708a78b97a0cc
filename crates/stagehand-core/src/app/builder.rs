//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 使用例
//! ```ignore
//! let engine = EngineBuilder::new()
//!     .register(SyncTags::new(api))?
//!     .resources(resources)
//!     .expect_tasks(&["SyncTags"])
//!     .build()?;
//! ```
//!
//! # Fail-fast 設計
//! - expect_tasks() で期待される type_name を登録
//! - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 設定値も build() 時に検証する

use std::sync::Arc;

use crate::config::{ConfigError, EngineConfig};
use crate::impls::{InMemoryLockTable, InMemoryReadyQueue, InMemoryTaskStore, TracingAuditSink};
use crate::ports::{
    AuditSink, Clock, IdGenerator, ReadyQueue, ResourceLock, ResourceProvider, SystemClock, TaskStore,
    UlidGenerator,
};
use crate::typed::{RegistryError, TaskRegistry, Workflow};

use super::engine::Engine;
use super::services::Services;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("no resource provider configured")]
    MissingResourceProvider,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// 未設定のポートは build() 時にインメモリ実装で埋めます
/// （ResourceProvider だけは必須）。
pub struct EngineBuilder {
    registry: TaskRegistry,
    expected_tasks: Option<Vec<String>>,
    store: Option<Arc<dyn TaskStore>>,
    queue: Option<Arc<dyn ReadyQueue>>,
    resources: Option<Arc<dyn ResourceProvider>>,
    locks: Option<Arc<dyn ResourceLock>>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: TaskRegistry::new(),
            expected_tasks: None,
            store: None,
            queue: None,
            resources: None,
            locks: None,
            audit: None,
            clock: None,
            ids: None,
            config: EngineConfig::default(),
        }
    }

    pub fn register<W: Workflow>(mut self, workflow: W) -> Result<Self, RegistryError> {
        self.registry.register(workflow)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn ReadyQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn resources(mut self, resources: Arc<dyn ResourceProvider>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn ResourceLock>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }
        self.config.validate()?;
        let resources = self.resources.ok_or(BuildError::MissingResourceProvider)?;

        let services = Services {
            store: self.store.unwrap_or_else(|| Arc::new(InMemoryTaskStore::new())),
            queue: self.queue.unwrap_or_else(|| Arc::new(InMemoryReadyQueue::new())),
            registry: Arc::new(self.registry),
            resources,
            locks: self.locks.unwrap_or_else(|| Arc::new(InMemoryLockTable::new())),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            ids: self.ids.unwrap_or_else(|| Arc::new(UlidGenerator::new(SystemClock))),
            config: self.config,
        };
        Ok(Engine::new(services))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::StageContext;
    use crate::domain::EngineError;
    use crate::impls::InMemoryResources;
    use crate::typed::StageTable;
    use futures::FutureExt;

    struct Noop;

    impl Noop {
        async fn on_init(&self, ctx: &mut StageContext) -> Result<(), EngineError> {
            ctx.set_stage_complete(None)
        }
    }

    impl Workflow for Noop {
        const TYPE: &'static str = "Noop";
        fn stages(table: &mut StageTable<Self>) {
            table.stage("OnInit", |w, ctx| w.on_init(ctx).boxed());
        }
    }

    #[test]
    fn build_success() {
        let engine = EngineBuilder::new()
            .register(Noop)
            .unwrap()
            .resources(Arc::new(InMemoryResources::new()))
            .expect_tasks(&[Noop::TYPE])
            .build();
        assert!(engine.is_ok());
    }

    #[test]
    fn build_missing_task_types() {
        let engine = EngineBuilder::new()
            .register(Noop)
            .unwrap()
            .resources(Arc::new(InMemoryResources::new()))
            .expect_tasks(&[Noop::TYPE, "SyncTags"])
            .build();
        assert!(matches!(
            engine,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec!["SyncTags".to_string()]
        ));
    }

    #[test]
    fn build_requires_resource_provider() {
        let engine = EngineBuilder::new().register(Noop).unwrap().build();
        assert!(matches!(engine, Err(BuildError::MissingResourceProvider)));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = EngineConfig {
            workers: 0,
            ..Default::default()
        };
        let engine = EngineBuilder::new()
            .resources(Arc::new(InMemoryResources::new()))
            .config(config)
            .build();
        assert!(matches!(engine, Err(BuildError::Config(_))));
    }
}
