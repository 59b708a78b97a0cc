//! Implementations - Port の具体的な実装
//!
//! - InMemory*: 開発・テスト用（単一プロセス）
//! - SqliteTaskStore: 永続化用（rusqlite）
//! - TracingAuditSink: 監査レコードを tracing イベントとして出力

pub mod audit;
pub mod lock_table;
pub mod memory_queue;
pub mod memory_resources;
pub mod memory_store;
pub mod sqlite_store;

pub use self::audit::{MemoryAuditSink, TracingAuditSink};
pub use self::lock_table::InMemoryLockTable;
pub use self::memory_queue::InMemoryReadyQueue;
pub use self::memory_resources::{InMemoryResources, StatusChange};
pub use self::memory_store::InMemoryTaskStore;
pub use self::sqlite_store::SqliteTaskStore;
