//! 轮换状态跟踪：认领、成功、失败三种记录，以及对外的状态查询。
//!
//! 所有写入都经过存储的单行条件更新；完成阶段的写入以 job id 为守卫，
//! 被接管的旧任务不会覆盖继任者的结果。

use crate::common::clock::Clock;
use crate::error::{Error, Result};
use crate::root::RootKeyring;
use crate::rotation::{RotationPolicy, RotationTrigger, secs};
use crate::storage::{ClaimOutcome, KmsKey, KmsKeyPatch, KmsStore, RotationClaim, RotationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// 一次成功的认领
#[derive(Debug, Clone)]
pub struct ClaimedRotation {
    /// 认领后的密钥行
    pub key: KmsKey,
    pub job_id: Uuid,
    pub trigger: RotationTrigger,
    pub started_at: DateTime<Utc>,
}

/// `get_rotation_status` 的返回值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationStatusReport {
    pub key_id: Uuid,
    pub status: RotationStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// 仅在显式请求时解密
    pub last_error: Option<String>,
    /// 是否存在已加密的错误摘要
    pub has_error: bool,
    pub is_manual: bool,
    pub job_id: Option<Uuid>,
    pub auto_rotation_enabled: bool,
    pub next_rotation_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl RotationStatusReport {
    /// 连续失败次数达到阈值，需要外部告警介入
    pub fn needs_escalation(&self, threshold: u32) -> bool {
        threshold > 0 && self.consecutive_failures >= threshold
    }
}

#[derive(Clone)]
pub struct RotationStatusTracker {
    store: Arc<dyn KmsStore>,
    root: Arc<RootKeyring>,
    clock: Arc<dyn Clock>,
    policy: RotationPolicy,
}

impl RotationStatusTracker {
    pub fn new(
        store: Arc<dyn KmsStore>,
        root: Arc<RootKeyring>,
        clock: Arc<dyn Clock>,
        policy: RotationPolicy,
    ) -> Self {
        Self {
            store,
            root,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// 把密钥切到 `in_progress`。
    ///
    /// 已有未过期的认领时返回 `RotationAlreadyInProgress`；自动认领时密钥已不再到期则返回 `Ok(None)`。
    pub async fn claim(
        &self,
        key_id: Uuid,
        trigger: RotationTrigger,
    ) -> Result<Option<ClaimedRotation>> {
        let now = self.clock.now();
        let claim = RotationClaim {
            job_id: Uuid::new_v4(),
            trigger,
            claimed_at: now,
            abandoned_before: now - self.policy.abandonment_timeout(),
        };

        match self.store.claim_rotation(key_id, &claim).await? {
            ClaimOutcome::Claimed(key) => {
                tracing::info!(
                    key_id = %key_id,
                    job_id = %claim.job_id,
                    trigger = %trigger,
                    "claimed KMS key rotation"
                );
                Ok(Some(ClaimedRotation {
                    key,
                    job_id: claim.job_id,
                    trigger,
                    started_at: now,
                }))
            }
            ClaimOutcome::AlreadyInProgress => {
                tracing::debug!(key_id = %key_id, trigger = %trigger, "rotation already claimed by another worker");
                Err(Error::RotationAlreadyInProgress(key_id))
            }
            ClaimOutcome::NotDue => {
                tracing::debug!(key_id = %key_id, "key is no longer due, skipping");
                Ok(None)
            }
        }
    }

    /// 记录成功并返回新的 `next_rotation_at`。
    ///
    /// 任务已被接管时不写入，返回 `RotationSuperseded`。
    pub async fn record_success(
        &self,
        claimed: &ClaimedRotation,
        finished_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        // 以最新的配置为准，认领期间可能有人修改了自动轮换设置
        let current = self
            .store
            .find_key(claimed.key.id)
            .await?
            .ok_or(Error::KeyNotFound(claimed.key.id))?;
        let next_rotation_at = next_due(&current, finished_at);

        let patch = KmsKeyPatch {
            last_rotation_status: Some(RotationStatus::Success),
            last_rotation_attempted_at: Some(claimed.started_at),
            encrypted_last_rotation_error: Some(None),
            last_rotation_was_manual: Some(claimed.trigger.is_manual()),
            consecutive_rotation_failures: Some(0),
            rotated_at: Some(finished_at),
            next_rotation_at: Some(next_rotation_at),
            only_if_job: Some(claimed.job_id),
            ..Default::default()
        };
        if self.store.update_key(claimed.key.id, patch).await?.is_none() {
            tracing::warn!(
                key_id = %claimed.key.id,
                job_id = %claimed.job_id,
                "rotation job was taken over before it completed, success not recorded"
            );
            return Err(Error::RotationSuperseded {
                key_id: claimed.key.id,
                job_id: claimed.job_id,
            });
        }
        Ok(next_rotation_at)
    }

    /// 记录失败：错误摘要以系统密钥加密，自动轮换的密钥按退避重新排期。
    pub async fn record_failure(&self, claimed: &ClaimedRotation, reason: &str) -> Result<()> {
        let now = self.clock.now();
        let failures = claimed.key.consecutive_rotation_failures.saturating_add(1);
        let current = self
            .store
            .find_key(claimed.key.id)
            .await?
            .ok_or(Error::KeyNotFound(claimed.key.id))?;
        let next_rotation_at = match (current.auto_rotation_enabled, current.rotation_interval_seconds) {
            (true, Some(interval)) => Some(now + self.policy.retry_delay(interval, failures)),
            _ => None,
        };

        let patch = KmsKeyPatch {
            last_rotation_status: Some(RotationStatus::Failed),
            last_rotation_attempted_at: Some(now),
            encrypted_last_rotation_error: Some(Some(self.root.seal_system(reason.as_bytes())?)),
            last_rotation_was_manual: Some(claimed.trigger.is_manual()),
            consecutive_rotation_failures: Some(failures),
            next_rotation_at: Some(next_rotation_at),
            only_if_job: Some(claimed.job_id),
            ..Default::default()
        };
        if self.store.update_key(claimed.key.id, patch).await?.is_none() {
            tracing::warn!(
                key_id = %claimed.key.id,
                job_id = %claimed.job_id,
                "rotation job was taken over before it failed, failure not recorded"
            );
            return Ok(());
        }

        if failures >= self.policy.escalation_threshold {
            tracing::error!(
                key_id = %claimed.key.id,
                consecutive_failures = failures,
                "KMS key rotation keeps failing"
            );
        } else {
            tracing::warn!(
                key_id = %claimed.key.id,
                job_id = %claimed.job_id,
                consecutive_failures = failures,
                retry_at = ?next_rotation_at,
                "KMS key rotation failed"
            );
        }
        Ok(())
    }

    pub async fn report(&self, key_id: Uuid, reveal_error: bool) -> Result<RotationStatusReport> {
        let key = self
            .store
            .find_key(key_id)
            .await?
            .ok_or(Error::KeyNotFound(key_id))?;

        let last_error = match (&key.encrypted_last_rotation_error, reveal_error) {
            (Some(encrypted), true) => {
                let plaintext = self.root.open_system(encrypted)?;
                Some(String::from_utf8_lossy(&plaintext).into_owned())
            }
            _ => None,
        };

        Ok(RotationStatusReport {
            key_id,
            status: key.last_rotation_status,
            last_attempt_at: key.last_rotation_attempted_at,
            last_success_at: key.rotated_at,
            last_error,
            has_error: key.encrypted_last_rotation_error.is_some(),
            is_manual: key.last_rotation_was_manual,
            job_id: key.last_rotation_job_id,
            auto_rotation_enabled: key.auto_rotation_enabled,
            next_rotation_at: key.next_rotation_at,
            consecutive_failures: key.consecutive_rotation_failures,
        })
    }
}

/// 成功轮换后的下一次到期时间
pub(crate) fn next_due(key: &KmsKey, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match (key.auto_rotation_enabled, key.rotation_interval_seconds) {
        (true, Some(interval)) => Some(from + secs(interval)),
        _ => None,
    }
}
