//! App - エンジン本体
//!
//! - builder: ワイヤリングと起動時検証
//! - engine: 呼び出し側の窓口
//! - dispatcher / scheduler: stage の実行とワーカープール
//! - context: handler に渡すコンテキスト
//! - transitions / subtask: 状態遷移と親子連結

pub mod builder;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod scheduler;
pub mod subtask;

mod services;
mod transitions;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::context::{StageContext, Transition};
pub use self::dispatcher::DispatchOutcome;
pub use self::engine::Engine;
pub use self::scheduler::Scheduler;
pub use self::subtask::SubtaskRequest;
