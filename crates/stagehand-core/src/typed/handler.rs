//! DynWorkflow - object-safe な Workflow の抽象化
//!
//! TypedWorkflow<W> を DynWorkflow に変換することで、
//! HashMap<String, Arc<dyn DynWorkflow>> に格納可能にします。

use crate::app::StageContext;

use super::workflow::{StageFuture, StageTable, Workflow};

pub trait DynWorkflow: Send + Sync {
    fn type_name(&self) -> &str;
    fn initial_stage(&self) -> &str;
    fn has_stage(&self, stage: &str) -> bool;
    fn stage_names(&self) -> Vec<String>;
    fn complete_status(&self) -> Option<&str>;
    fn failed_status(&self) -> Option<&str>;

    /// `None` when the workflow declares no handler for `stage`.
    fn run_stage<'a>(&'a self, stage: &str, ctx: &'a mut StageContext) -> Option<StageFuture<'a>>;
}

pub struct TypedWorkflow<W: Workflow> {
    workflow: W,
    table: StageTable<W>,
}

impl<W: Workflow> TypedWorkflow<W> {
    /// The table must already be validated.
    pub(crate) fn new(workflow: W, table: StageTable<W>) -> Self {
        Self { workflow, table }
    }
}

impl<W: Workflow> DynWorkflow for TypedWorkflow<W> {
    fn type_name(&self) -> &str {
        W::TYPE
    }

    fn initial_stage(&self) -> &str {
        self.table
            .stages
            .first()
            .map(|(name, _)| name.as_str())
            .unwrap_or_default()
    }

    fn has_stage(&self, stage: &str) -> bool {
        self.table.get(stage).is_some()
    }

    fn stage_names(&self) -> Vec<String> {
        self.table.stages.iter().map(|(name, _)| name.clone()).collect()
    }

    fn complete_status(&self) -> Option<&str> {
        self.table.complete_status.as_deref()
    }

    fn failed_status(&self) -> Option<&str> {
        self.table.failed_status.as_deref()
    }

    fn run_stage<'a>(&'a self, stage: &str, ctx: &'a mut StageContext) -> Option<StageFuture<'a>> {
        let handler = self.table.get(stage)?;
        Some(handler(&self.workflow, ctx))
    }
}
