//! InMemoryReadyQueue - 開発用の配送キュー
//!
//! - ready: すぐに取り出せる task_id
//! - scheduled: push_after で遅延投入された task_id（min-heap）
//! - Notify で pop 待ちのワーカーを起こす

use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::TaskId;
use crate::ports::{QueueError, ReadyQueue};

/// Delayed entry. Reverse ordering so the heap pops the earliest first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    ready_at: Instant,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<TaskId>,
    scheduled: BinaryHeap<ScheduledTask>,
}

impl QueueState {
    fn promote_scheduled(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.ready_at > now {
                break;
            }
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.task_id);
            }
        }
    }
}

pub struct InMemoryReadyQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryReadyQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }
}

impl Default for InMemoryReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadyQueue for InMemoryReadyQueue {
    async fn push(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.state.lock().await.ready.push_back(task_id);
        self.notify.notify_one();
        Ok(())
    }

    async fn push_after(&self, task_id: TaskId, delay: Duration) -> Result<(), QueueError> {
        let entry = ScheduledTask {
            ready_at: Instant::now() + delay,
            task_id,
        };
        self.state.lock().await.scheduled.push(entry);
        // 待機中の pop に起床時刻を再計算させる
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<TaskId>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote_scheduled(now);

                if let Some(task_id) = state.ready.pop_front() {
                    return Ok(Some(task_id));
                }
                if now >= deadline {
                    return Ok(None);
                }
                state
                    .scheduled
                    .peek()
                    .map(|entry| entry.ready_at.min(deadline))
                    .unwrap_or(deadline)
            };

            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.scheduled.len()
    }
}
