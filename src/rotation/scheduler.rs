//! 后台轮换调度器。
//!
//! 每个轮询周期查询到期密钥，逐个以比较并交换认领后并行执行轮换。
//! 调度器可以多实例冗余运行，正确性只依赖存储的条件更新。

use crate::error::{Error, Result};
use crate::rotation::manager::{KeyManager, RotationOutcome};
use crate::rotation::{RotationPolicy, RotationTrigger};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 一个轮询周期的汇总
#[derive(Debug, Default, Clone)]
pub struct RotationCycleReport {
    pub rotated: Vec<RotationOutcome>,
    /// 轮换失败的密钥
    pub failed: Vec<Uuid>,
    /// 被其他实例抢先认领或已不再到期
    pub skipped: usize,
}

impl RotationCycleReport {
    pub fn is_idle(&self) -> bool {
        self.rotated.is_empty() && self.failed.is_empty() && self.skipped == 0
    }
}

enum KeyResult {
    Rotated(RotationOutcome),
    Failed(Uuid),
    Skipped,
}

#[derive(Clone)]
pub struct RotationScheduler {
    manager: Arc<KeyManager>,
    policy: RotationPolicy,
}

impl RotationScheduler {
    pub fn new(manager: Arc<KeyManager>) -> Self {
        let policy = manager.tracker().policy().clone();
        Self { manager, policy }
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// 执行一个轮询周期
    pub async fn run_once(&self) -> Result<RotationCycleReport> {
        let now = self.manager.clock().now();
        let abandoned_before = now - self.policy.abandonment_timeout();
        let due = self
            .manager
            .store()
            .list_due_keys(now, abandoned_before, self.policy.batch_size)
            .await?;

        let mut report = RotationCycleReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        debug!(due = due.len(), "found KMS keys due for rotation");

        let mut tasks = JoinSet::new();
        for key in due {
            let manager = self.manager.clone();
            tasks.spawn(async move { rotate_one(&manager, key.id).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(KeyResult::Rotated(outcome)) => report.rotated.push(outcome),
                Ok(KeyResult::Failed(key_id)) => report.failed.push(key_id),
                Ok(KeyResult::Skipped) => report.skipped += 1,
                Err(e) => error!(error = %e, "rotation task panicked"),
            }
        }

        info!(
            rotated = report.rotated.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            "rotation cycle finished"
        );
        Ok(report)
    }

    /// 在后台任务中启动轮询循环，返回用于关闭的句柄
    pub fn start(self) -> RotationSchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(async move {
            self.run_loop(shutdown_rx).await;
        });
        RotationSchedulerHandle {
            shutdown_tx,
            task_handle,
        }
    }

    async fn run_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.policy.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_secs = self.policy.poll_interval_secs,
            batch_size = self.policy.batch_size,
            "KMS rotation scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "rotation cycle failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("KMS rotation scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn rotate_one(manager: &KeyManager, key_id: Uuid) -> KeyResult {
    let claimed = match manager.tracker().claim(key_id, RotationTrigger::Automatic).await {
        Ok(Some(claimed)) => claimed,
        Ok(None) => return KeyResult::Skipped,
        Err(e) if e.is_expected_contention() => return KeyResult::Skipped,
        Err(Error::KeyNotFound(_)) => return KeyResult::Skipped,
        Err(e) => {
            warn!(key_id = %key_id, error = %e, "failed to claim KMS key rotation");
            return KeyResult::Failed(key_id);
        }
    };

    match manager.execute(claimed).await {
        Ok(outcome) => KeyResult::Rotated(outcome),
        Err(e) if e.is_expected_contention() => KeyResult::Skipped,
        Err(_) => KeyResult::Failed(key_id),
    }
}

/// 调度器后台任务的句柄
pub struct RotationSchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    task_handle: JoinHandle<()>,
}

impl RotationSchedulerHandle {
    /// 通知循环退出并等待进行中的周期结束
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task_handle.await {
            error!(error = %e, "rotation scheduler task ended abnormally");
        }
        info!("KMS rotation scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }
}
