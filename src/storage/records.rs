//! Row types of the KMS tables and the single-row predicates every backend shares.
// 中文: KMS 表的行类型，以及所有存储后端共用的单行判定逻辑。

use crate::rotation::RotationTrigger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 根配置行的固定主键
pub const ROOT_CONFIG_ID: Uuid = Uuid::nil();

/// 最近一次轮换尝试的状态（不是最近一次成功）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationStatus {
    #[default]
    None,
    InProgress,
    Success,
    Failed,
}

/// `kms_keys` 表的一行：一个按组织或项目划分的逻辑根密钥。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmsKey {
    pub id: Uuid,
    /// 所属组织或项目
    pub scope_id: Uuid,
    pub slug: String,
    /// 平台自动创建的默认密钥
    pub is_reserved: bool,

    /// 为空表示只允许手动轮换
    pub rotation_interval_seconds: Option<u64>,
    pub auto_rotation_enabled: bool,
    /// 当且仅当 `auto_rotation_enabled` 时有值
    pub next_rotation_at: Option<DateTime<Utc>>,

    pub last_rotation_status: RotationStatus,
    pub last_rotation_attempted_at: Option<DateTime<Utc>>,
    pub last_rotation_job_id: Option<Uuid>,
    /// 由系统密钥加密，打包格式见 `SealedBox::to_packed`
    pub encrypted_last_rotation_error: Option<Vec<u8>>,
    pub last_rotation_was_manual: bool,
    pub consecutive_rotation_failures: u32,

    /// 最近一次成功轮换的时间
    pub rotated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KmsKey {
    /// 自动轮换已开启且已到期
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.auto_rotation_enabled && self.next_rotation_at.is_some_and(|at| at <= now)
    }

    /// 处于 `in_progress` 但认领时间早于 `abandoned_before`，视为持有者已崩溃
    pub fn is_claim_abandoned(&self, abandoned_before: DateTime<Utc>) -> bool {
        self.last_rotation_status == RotationStatus::InProgress
            && self
                .last_rotation_attempted_at
                .is_none_or(|at| at < abandoned_before)
    }

    pub fn is_claimable(&self, abandoned_before: DateTime<Utc>) -> bool {
        self.last_rotation_status != RotationStatus::InProgress
            || self.is_claim_abandoned(abandoned_before)
    }

    /// 调度器的到期查询条件
    pub fn is_selectable_for_rotation(
        &self,
        now: DateTime<Utc>,
        abandoned_before: DateTime<Utc>,
    ) -> bool {
        self.is_due(now) && self.is_claimable(abandoned_before)
    }

    /// 条件更新：只有满足认领条件时才把状态切到 `in_progress`
    pub fn try_claim(&mut self, claim: &RotationClaim) -> ClaimOutcome {
        if !self.is_claimable(claim.abandoned_before) {
            return ClaimOutcome::AlreadyInProgress;
        }
        if claim.trigger == RotationTrigger::Automatic && !self.is_due(claim.claimed_at) {
            return ClaimOutcome::NotDue;
        }
        self.last_rotation_status = RotationStatus::InProgress;
        self.last_rotation_attempted_at = Some(claim.claimed_at);
        self.last_rotation_job_id = Some(claim.job_id);
        self.last_rotation_was_manual = claim.trigger.is_manual();
        self.updated_at = claim.claimed_at;
        ClaimOutcome::Claimed(self.clone())
    }
}

/// `kms_key_versions` 表的一行，写入后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmsKeyVersion {
    pub id: Uuid,
    pub kms_key_id: Uuid,
    pub version: u32,
    /// 由根密钥加密的原始密钥材料
    #[serde(with = "serde_bytes")]
    pub encrypted_key_material: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// 一次认领尝试
#[derive(Debug, Clone)]
pub struct RotationClaim {
    pub job_id: Uuid,
    pub trigger: RotationTrigger,
    pub claimed_at: DateTime<Utc>,
    pub abandoned_before: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// 认领成功，附带更新后的行
    Claimed(KmsKey),
    AlreadyInProgress,
    /// 自动认领时密钥已不再到期（通常是别的实例刚完成了轮换）
    NotDue,
}

/// 对 `kms_keys` 单行的部分更新。`None` 表示不修改该列。
#[derive(Debug, Clone, Default)]
pub struct KmsKeyPatch {
    pub rotation_interval_seconds: Option<Option<u64>>,
    pub auto_rotation_enabled: Option<bool>,
    pub next_rotation_at: Option<Option<DateTime<Utc>>>,
    pub last_rotation_status: Option<RotationStatus>,
    pub last_rotation_attempted_at: Option<DateTime<Utc>>,
    pub encrypted_last_rotation_error: Option<Option<Vec<u8>>>,
    pub last_rotation_was_manual: Option<bool>,
    pub consecutive_rotation_failures: Option<u32>,
    pub rotated_at: Option<DateTime<Utc>>,
    /// 仅当行上的 `last_rotation_job_id` 等于该值时才应用
    pub only_if_job: Option<Uuid>,
}

impl KmsKeyPatch {
    /// 守卫条件是否满足
    pub fn guard_holds(&self, key: &KmsKey) -> bool {
        self.only_if_job
            .is_none_or(|job| key.last_rotation_job_id == Some(job))
    }

    pub fn apply(&self, key: &mut KmsKey, now: DateTime<Utc>) {
        if let Some(v) = self.rotation_interval_seconds {
            key.rotation_interval_seconds = v;
        }
        if let Some(v) = self.auto_rotation_enabled {
            key.auto_rotation_enabled = v;
        }
        if let Some(v) = self.next_rotation_at {
            key.next_rotation_at = v;
        }
        if let Some(v) = self.last_rotation_status {
            key.last_rotation_status = v;
        }
        if let Some(v) = self.last_rotation_attempted_at {
            key.last_rotation_attempted_at = Some(v);
        }
        if let Some(v) = &self.encrypted_last_rotation_error {
            key.encrypted_last_rotation_error = v.clone();
        }
        if let Some(v) = self.last_rotation_was_manual {
            key.last_rotation_was_manual = v;
        }
        if let Some(v) = self.consecutive_rotation_failures {
            key.consecutive_rotation_failures = v;
        }
        if let Some(v) = self.rotated_at {
            key.rotated_at = Some(v);
        }
        key.updated_at = now;
    }
}

/// `kms_root_config` 单例行：被运维密钥加密的平台根密钥
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootConfigRecord {
    pub id: Uuid,
    #[serde(with = "serde_bytes")]
    pub encrypted_root_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// 组织或项目与其默认 KMS 密钥、数据密钥的绑定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeKeyBinding {
    pub scope_id: Uuid,
    pub kms_key_id: Uuid,
    /// `WrappedSecret::to_blob` 格式的数据密钥
    pub encrypted_data_key: Option<Vec<u8>>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key_at(now: DateTime<Utc>) -> KmsKey {
        KmsKey {
            id: Uuid::new_v4(),
            scope_id: Uuid::new_v4(),
            slug: "k".to_string(),
            is_reserved: false,
            rotation_interval_seconds: Some(3600),
            auto_rotation_enabled: true,
            next_rotation_at: Some(now),
            last_rotation_status: RotationStatus::None,
            last_rotation_attempted_at: None,
            last_rotation_job_id: None,
            encrypted_last_rotation_error: None,
            last_rotation_was_manual: false,
            consecutive_rotation_failures: 0,
            rotated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn claim(now: DateTime<Utc>, trigger: RotationTrigger) -> RotationClaim {
        RotationClaim {
            job_id: Uuid::new_v4(),
            trigger,
            claimed_at: now,
            abandoned_before: now - Duration::minutes(5),
        }
    }

    #[test]
    fn disabled_key_is_never_due() {
        let now = Utc::now();
        let mut key = key_at(now - Duration::days(30));
        key.auto_rotation_enabled = false;
        assert!(!key.is_due(now));
        assert!(!key.is_selectable_for_rotation(now, now));
    }

    #[test]
    fn second_claim_loses_until_abandoned() {
        let now = Utc::now();
        let mut key = key_at(now);

        assert!(matches!(
            key.try_claim(&claim(now, RotationTrigger::Automatic)),
            ClaimOutcome::Claimed(_)
        ));
        assert_eq!(
            key.try_claim(&claim(now, RotationTrigger::Manual)),
            ClaimOutcome::AlreadyInProgress
        );

        let later = now + Duration::minutes(6);
        let takeover = claim(later, RotationTrigger::Automatic);
        assert!(matches!(key.try_claim(&takeover), ClaimOutcome::Claimed(_)));
        assert_eq!(key.last_rotation_job_id, Some(takeover.job_id));
    }

    #[test]
    fn automatic_claim_requires_due_key() {
        let now = Utc::now();
        let mut key = key_at(now + Duration::hours(1));
        assert_eq!(
            key.try_claim(&claim(now, RotationTrigger::Automatic)),
            ClaimOutcome::NotDue
        );
        assert!(matches!(
            key.try_claim(&claim(now, RotationTrigger::Manual)),
            ClaimOutcome::Claimed(k) if k.last_rotation_was_manual
        ));
    }

    #[test]
    fn patch_guard_checks_job_id() {
        let now = Utc::now();
        let mut key = key_at(now);
        let job = Uuid::new_v4();
        key.last_rotation_job_id = Some(job);

        let patch = KmsKeyPatch {
            last_rotation_status: Some(RotationStatus::Success),
            only_if_job: Some(Uuid::new_v4()),
            ..Default::default()
        };
        assert!(!patch.guard_holds(&key));

        let patch = KmsKeyPatch {
            only_if_job: Some(job),
            ..patch
        };
        assert!(patch.guard_holds(&key));
        patch.apply(&mut key, now);
        assert_eq!(key.last_rotation_status, RotationStatus::Success);
    }
}
