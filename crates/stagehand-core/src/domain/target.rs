//! Target reference: which resource a task operates on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::EngineError;

/// `{kind}/{id}` (e.g. `mongodb/42`, `secgroupcache/7`).
///
/// Serialized as the string form so it can sit inside payloads and
/// TEXT columns unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetRef {
    kind: String,
    id: String,
}

impl TargetRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl FromStr for TargetRef {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| EngineError::InvalidTarget {
            target: s.to_string(),
            reason: reason.to_string(),
        };
        let (kind, id) = s.split_once('/').ok_or_else(|| invalid("expected kind/id"))?;
        if kind.is_empty() || id.is_empty() {
            return Err(invalid("kind and id must be non-empty"));
        }
        Ok(Self::new(kind, id))
    }
}

impl TryFrom<String> for TargetRef {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetRef> for String {
    fn from(target: TargetRef) -> Self {
        target.to_string()
    }
}
