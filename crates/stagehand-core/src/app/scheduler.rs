//! Scheduler - ワーカープール
//!
//! - ReadyQueue から task_id を取り出して Dispatcher に渡す
//! - 対象がロック中なら requeue_delay 後に再投入（ワーカーは塞がない）
//! - ストレージ等の一時的な失敗も同じく requeue_delay 後に再投入
//! - shutdown は新しい取り出しを止めるだけで、実行中の stage は最後まで走る

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::TaskId;

use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::services::Services;

/// Worker group handle.
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
/// - drop しただけでは止まらない（tokio タスクは detach される）
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn spawn(n: usize, services: Arc<Services>, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let services = Arc::clone(&services);
            let dispatcher = Arc::clone(&dispatcher);
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, services, dispatcher, &mut rx).await;
            }));
        }
        info!(workers = n, "scheduler started");

        Self { shutdown_tx, joins }
    }

    pub fn workers(&self) -> usize {
        self.joins.len()
    }

    /// Stop taking new work. In-flight stages run to completion.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("scheduler stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    services: Arc<Services>,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let poll = services.config.poll_interval();
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let popped = tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender が消えたら止まる
                if changed.is_err() {
                    break;
                }
                continue;
            }
            popped = services.queue.pop(poll) => popped,
        };

        let task_id = match popped {
            Ok(Some(task_id)) => task_id,
            Ok(None) => continue,
            Err(e) => {
                warn!(worker_id, error = %e, "ready queue pop failed");
                tokio::time::sleep(poll).await;
                continue;
            }
        };

        match dispatcher.dispatch(task_id).await {
            Ok(DispatchOutcome::Requeue) => requeue(worker_id, &services, task_id).await,
            Ok(outcome) => debug!(worker_id, task_id = %task_id, ?outcome, "dispatch finished"),
            // 永続化に失敗した record は running のまま残るので、ここで拾い直す
            Err(e) if e.is_retryable() => {
                warn!(worker_id, task_id = %task_id, error = %e, "dispatch failed, requeueing");
                requeue(worker_id, &services, task_id).await;
            }
            Err(e) => error!(worker_id, task_id = %task_id, error = %e, "dispatch failed"),
        }
    }
    debug!(worker_id, "worker stopped");
}

async fn requeue(worker_id: usize, services: &Services, task_id: TaskId) {
    let delay: Duration = services.config.requeue_delay();
    if let Err(e) = services.queue.push_after(task_id, delay).await {
        error!(worker_id, task_id = %task_id, error = %e, "requeue failed");
    }
}
