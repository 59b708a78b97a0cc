//! Task status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::EngineError;

/// Status of a Task Record.
///
/// State transitions:
/// - Pending -> Running (dispatcher claims a stage)
/// - Running -> Pending (set_stage / start_subtask)
/// - Running | Pending -> Complete | Failed (terminal, immutable afterwards)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }

    /// Does startup recovery pick this record up?
    pub fn is_resumable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "complete" => Ok(TaskStatus::Complete),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(EngineError::Storage(format!("unknown task status '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskStatus::Pending, false, true)]
    #[case(TaskStatus::Running, false, true)]
    #[case(TaskStatus::Complete, true, false)]
    #[case(TaskStatus::Failed, true, false)]
    fn terminal_and_resumable_are_disjoint(
        #[case] status: TaskStatus,
        #[case] terminal: bool,
        #[case] resumable: bool,
    ) {
        assert_eq!(status.is_terminal(), terminal);
        assert_eq!(status.is_resumable(), resumable);
        assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
    }

    #[test]
    fn serializes_snake_case() {
        assert_eq!(serde_json::to_string(&TaskStatus::Complete).unwrap(), "\"complete\"");
    }
}
