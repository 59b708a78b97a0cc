//! stagehand-core
//!
//! Stage-based, persisted, resumable task orchestration for resource-mutating
//! workflows.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, target, actor, stage, status, payload, record, audit, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, ReadyQueue, ResourceProvider, ResourceLock, AuditSink, Clock, IdGenerator）
//! - **impls**: 実装（インメモリ実装一式、SqliteTaskStore、TracingAuditSink）
//! - **typed**: 型付き Workflow API（Workflow trait, StageTable, TaskRegistry）
//! - **app**: エンジン本体（builder, engine, dispatcher, scheduler, context, subtask）
//! - **retry**: 一時的な失敗のリトライとバックオフ
//! - **config**: EngineConfig（TOML）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod retry;
pub mod typed;

pub use app::{DispatchOutcome, Engine, EngineBuilder, StageContext, SubtaskRequest};
pub use config::EngineConfig;
pub use domain::{Actor, EngineError, NewTask, Payload, TargetRef, TaskId, TaskRecord, TaskStatus};
pub use typed::{StageTable, Workflow};
