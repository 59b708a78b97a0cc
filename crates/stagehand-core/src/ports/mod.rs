//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。エンジンが外部と接する境界は
//! すべてここの trait を通します。
//!
//! - TaskStore: Task Record の正本（source of truth）
//! - ReadyQueue: 実行可能な task_id の配送（状態や payload は含まない）
//! - ResourceProvider: リソースの解決とステータス更新（スキーマは所有しない）
//! - ResourceLock: target_ref 単位の排他
//! - AuditSink: 監査ログ（fire-and-forget）
//! - Clock / IdGenerator: テスト容易性のための抽象化

pub mod audit_sink;
pub mod clock;
pub mod id_generator;
pub mod ready_queue;
pub mod resource;
pub mod resource_lock;
pub mod task_store;

pub use self::audit_sink::AuditSink;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::ready_queue::{QueueError, ReadyQueue};
pub use self::resource::{Resource, ResourceProvider};
pub use self::resource_lock::ResourceLock;
pub use self::task_store::{TaskQuery, TaskStore};
