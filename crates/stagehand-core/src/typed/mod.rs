//! Typed - 型付き Workflow API
//!
//! タスク種別ごとの stage handler の対応表を型で組み立てます。
//!
//! # 二層構造
//! - **表層（Typed）**: `Workflow` trait, `StageTable<W>` - 型安全
//! - **内部（Dyn）**: `DynWorkflow` trait - object-safe, type erasure

pub mod handler;
pub mod registry;
pub mod workflow;

pub use self::handler::{DynWorkflow, TypedWorkflow};
pub use self::registry::{RegistryError, TaskRegistry};
pub use self::workflow::{StageFuture, StageTable, Workflow};
