//! Stage names and the continuation naming convention.

/// Conventional name for a workflow's entry stage. The engine itself treats
/// the first registered stage as the entry point.
pub const INIT_STAGE: &str = "OnInit";

/// Terminal stage after `set_stage_complete`.
pub const COMPLETE_STAGE: &str = "complete";

/// Terminal stage after `set_stage_failed`.
pub const FAILED_STAGE: &str = "failed";

/// Sentinel stage while a parent waits for its child.
pub const WAITING_FOR_CHILD: &str = "__waiting_for_child__";

/// Stage names a workflow may not register.
pub fn is_reserved(stage: &str) -> bool {
    matches!(stage, COMPLETE_STAGE | FAILED_STAGE | WAITING_FOR_CHILD)
}

/// Continuation stage after a child of purpose `X` completes: `On<X>Complete`.
pub fn on_complete(purpose: &str) -> String {
    format!("On{purpose}Complete")
}

/// Continuation stage after a child of purpose `X` fails: `On<X>CompleteFailed`.
pub fn on_complete_failed(purpose: &str) -> String {
    format!("On{purpose}CompleteFailed")
}
