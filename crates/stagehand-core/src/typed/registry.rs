//! TaskRegistry - Workflow の登録と管理
//!
//! # 使用例
//! ```ignore
//! let mut registry = TaskRegistry::new();
//! registry.register(SyncTags::new(api))?;
//!
//! let workflow = registry.get("SyncTags");
//! ```
//!
//! 登録時に stage 表を検証します（空、重複、予約名）。

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynWorkflow, TypedWorkflow};
use super::workflow::{StageTable, Workflow};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow for task type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("workflow '{0}' declares no stages")]
    NoStages(String),

    #[error("workflow '{type_name}' declares stage '{stage}' twice")]
    DuplicateStage { type_name: String, stage: String },

    #[error("workflow '{type_name}' uses reserved stage name '{stage}'")]
    ReservedStage { type_name: String, stage: String },
}

#[derive(Default)]
pub struct TaskRegistry {
    workflows: HashMap<String, Arc<dyn DynWorkflow>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Workflow>(&mut self, workflow: W) -> Result<(), RegistryError> {
        let type_name = W::TYPE.to_string();
        if self.workflows.contains_key(&type_name) {
            return Err(RegistryError::AlreadyRegistered(type_name));
        }
        let mut table = StageTable::new();
        W::stages(&mut table);
        table.validate(&type_name)?;
        self.workflows
            .insert(type_name, Arc::new(TypedWorkflow::new(workflow, table)));
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn DynWorkflow>> {
        self.workflows.get(type_name).cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.workflows.contains_key(type_name)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.workflows.keys().cloned().collect();
        types.sort();
        types
    }
}
