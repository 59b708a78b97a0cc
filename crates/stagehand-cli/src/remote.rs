//! Remote API seams used by the example workflows.
//!
//! 本物のクラウドドライバはこの crate の外にあります。ここでは trait と、
//! テスト・デモ用に操作ごとの応答を台本として積める `ScriptedCloud` だけを持ちます。

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_core::TargetRef;
use stagehand_core::domain::{RemoteError, RemoteErrorKind};
use tokio::sync::Mutex;

pub type Tags = BTreeMap<String, String>;

/// Operation names, used for scripting and call counting.
pub mod ops {
    pub const GET_TAGS: &str = "get_tags";
    pub const SET_TAGS: &str = "set_tags";
    pub const GET_STATUS: &str = "get_status";
    pub const APPLY_SNAPSHOT_POLICY: &str = "apply_snapshot_policy";
}

#[async_trait]
pub trait TagApi: Send + Sync {
    async fn get_tags(&self, target: &TargetRef) -> Result<Tags, RemoteError>;

    /// `replace = false` merges into the existing tags.
    async fn set_tags(&self, target: &TargetRef, tags: &Tags, replace: bool) -> Result<(), RemoteError>;
}

/// What the cloud reports about a resource (database, security group cache, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub name: String,
    pub status: String,
}

#[async_trait]
pub trait StatusApi: Send + Sync {
    /// `NotFound` when the cloud has no such resource.
    async fn get_status(&self, target: &TargetRef) -> Result<RemoteStatus, RemoteError>;
}

#[async_trait]
pub trait SnapshotPolicyApi: Send + Sync {
    async fn apply_snapshot_policy(&self, target: &TargetRef, policy_id: &str) -> Result<(), RemoteError>;
}

#[derive(Default)]
struct CloudState {
    scripts: HashMap<String, VecDeque<Result<(), RemoteError>>>,
    calls: HashMap<String, u32>,
    tags: HashMap<TargetRef, Tags>,
    statuses: HashMap<TargetRef, RemoteStatus>,
    applied_policies: Vec<(TargetRef, String)>,
}

impl CloudState {
    /// Count the call and pop the next scripted outcome.
    fn next(&mut self, operation: &str) -> Result<(), RemoteError> {
        *self.calls.entry(operation.to_string()).or_default() += 1;
        self.scripts
            .get_mut(operation)
            .and_then(|script| script.pop_front())
            .unwrap_or(Ok(()))
    }
}

/// In-process cloud that answers from per-operation scripts.
///
/// 台本が空の操作は成功します。台本に積んだ `Err` は先頭から 1 回ずつ消費されます。
#[derive(Default)]
pub struct ScriptedCloud {
    state: Mutex<CloudState>,
}

impl ScriptedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append outcomes for `operation`; each call consumes one.
    pub async fn script(&self, operation: &str, outcomes: impl IntoIterator<Item = Result<(), RemoteError>>) {
        let mut state = self.state.lock().await;
        state
            .scripts
            .entry(operation.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Make the next `times` calls of `operation` fail with `err`.
    pub async fn fail_times(&self, operation: &str, err: RemoteError, times: usize) {
        self.script(operation, std::iter::repeat_n(Err(err), times)).await;
    }

    pub async fn calls(&self, operation: &str) -> u32 {
        self.state.lock().await.calls.get(operation).copied().unwrap_or(0)
    }

    pub async fn put_tags(&self, target: TargetRef, tags: Tags) {
        self.state.lock().await.tags.insert(target, tags);
    }

    pub async fn tags(&self, target: &TargetRef) -> Tags {
        self.state.lock().await.tags.get(target).cloned().unwrap_or_default()
    }

    pub async fn put_status(&self, target: TargetRef, name: &str, status: &str) {
        let remote = RemoteStatus {
            name: name.to_string(),
            status: status.to_string(),
        };
        self.state.lock().await.statuses.insert(target, remote);
    }

    pub async fn applied_policies(&self) -> Vec<(TargetRef, String)> {
        self.state.lock().await.applied_policies.clone()
    }
}

#[async_trait]
impl TagApi for ScriptedCloud {
    async fn get_tags(&self, target: &TargetRef) -> Result<Tags, RemoteError> {
        let mut state = self.state.lock().await;
        state.next(ops::GET_TAGS)?;
        Ok(state.tags.get(target).cloned().unwrap_or_default())
    }

    async fn set_tags(&self, target: &TargetRef, tags: &Tags, replace: bool) -> Result<(), RemoteError> {
        let mut state = self.state.lock().await;
        state.next(ops::SET_TAGS)?;
        let current = state.tags.entry(target.clone()).or_default();
        if replace {
            current.clear();
        }
        current.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

#[async_trait]
impl StatusApi for ScriptedCloud {
    async fn get_status(&self, target: &TargetRef) -> Result<RemoteStatus, RemoteError> {
        let mut state = self.state.lock().await;
        state.next(ops::GET_STATUS)?;
        state
            .statuses
            .get(target)
            .cloned()
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, target.to_string()))
    }
}

#[async_trait]
impl SnapshotPolicyApi for ScriptedCloud {
    async fn apply_snapshot_policy(&self, target: &TargetRef, policy_id: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().await;
        state.next(ops::APPLY_SNAPSHOT_POLICY)?;
        state.applied_policies.push((target.clone(), policy_id.to_string()));
        Ok(())
    }
}
