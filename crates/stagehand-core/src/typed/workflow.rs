//! Workflow trait - タスク種別と stage handler の定義
//!
//! # 使用例
//! ```ignore
//! struct SyncTags { api: Arc<dyn TagApi> }
//!
//! impl Workflow for SyncTags {
//!     const TYPE: &'static str = "SyncTags";
//!
//!     fn stages(table: &mut StageTable<Self>) {
//!         table
//!             .stage("OnInit", |w, ctx| w.on_init(ctx).boxed())
//!             .failed_status("update_tags_failed");
//!     }
//! }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::app::StageContext;
use crate::domain::EngineError;
use crate::domain::stage::{FAILED_STAGE, is_reserved};

use super::registry::RegistryError;

/// What a stage handler returns. The transition itself is requested through
/// the context; `Err` fails the task.
pub type StageFuture<'a> = BoxFuture<'a, Result<(), EngineError>>;

pub(crate) type StageHandler<W> =
    Arc<dyn for<'a> Fn(&'a W, &'a mut StageContext) -> StageFuture<'a> + Send + Sync>;

/// Workflow はタスク種別（type_name）と stage handler を対応付ける
///
/// # Trait Bounds
/// - `Send + Sync`: 複数ワーカーから同時に参照されるため
/// - `'static`: Arc に格納できるため
pub trait Workflow: Send + Sync + Sized + 'static {
    /// type_name。Task Record にそのまま保存されます。
    const TYPE: &'static str;

    /// Declare stage handlers. The first declared stage is the initial one.
    fn stages(table: &mut StageTable<Self>);
}

pub struct StageTable<W> {
    pub(crate) stages: Vec<(String, StageHandler<W>)>,
    pub(crate) complete_status: Option<String>,
    pub(crate) failed_status: Option<String>,
}

impl<W> StageTable<W> {
    pub(crate) fn new() -> Self {
        Self {
            stages: Vec::new(),
            complete_status: None,
            failed_status: Some(FAILED_STAGE.to_string()),
        }
    }

    pub fn stage<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a W, &'a mut StageContext) -> StageFuture<'a> + Send + Sync + 'static,
    {
        self.stages.push((name.to_string(), Arc::new(handler)));
        self
    }

    /// Resource status written when the task completes. Unset leaves the
    /// resource alone.
    pub fn complete_status(&mut self, status: &str) -> &mut Self {
        self.complete_status = Some(status.to_string());
        self
    }

    /// Resource status written when the task fails (default `"failed"`).
    pub fn failed_status(&mut self, status: &str) -> &mut Self {
        self.failed_status = Some(status.to_string());
        self
    }

    /// Do not touch the resource status on failure.
    pub fn keep_status_on_failure(&mut self) -> &mut Self {
        self.failed_status = None;
        self
    }

    pub(crate) fn validate(&self, type_name: &str) -> Result<(), RegistryError> {
        if self.stages.is_empty() {
            return Err(RegistryError::NoStages(type_name.to_string()));
        }
        let mut seen = HashSet::new();
        for (name, _) in &self.stages {
            if is_reserved(name) {
                return Err(RegistryError::ReservedStage {
                    type_name: type_name.to_string(),
                    stage: name.clone(),
                });
            }
            if !seen.insert(name.as_str()) {
                return Err(RegistryError::DuplicateStage {
                    type_name: type_name.to_string(),
                    stage: name.clone(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<&StageHandler<W>> {
        self.stages.iter().find(|(n, _)| n == name).map(|(_, h)| h)
    }
}
