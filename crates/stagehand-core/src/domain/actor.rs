use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of whoever initiated a task.
///
/// Propagated unchanged to every stage handler, every child task and every
/// audit record, so authorization and attribution follow the work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub user_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            project_id: None,
            roles: Vec::new(),
        }
    }

    /// Background reconciliation loops run as this actor.
    pub fn system() -> Self {
        Self::new("system", "system").with_role("admin")
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.user_name, self.user_id)
    }
}
