//! Domain model (ids, targets, records, payloads, errors, ...).
//!
//! このモジュールはストレージやキューを前提にしません。
//! タスクの「形」と状態遷移のルールだけを定義します。

pub mod actor;
pub mod audit;
pub mod errors;
pub mod ids;
pub mod payload;
pub mod record;
pub mod remote;
pub mod stage;
pub mod status;
pub mod target;

pub use actor::Actor;
pub use audit::{AuditEntry, AuditOutcome, StageEntry};
pub use errors::{EngineError, ErrorKind};
pub use ids::{IdParseError, TaskId};
pub use payload::Payload;
pub use record::{Continuation, NewTask, TaskRecord};
pub use remote::{RemoteError, RemoteErrorKind};
pub use status::TaskStatus;
pub use target::TargetRef;
