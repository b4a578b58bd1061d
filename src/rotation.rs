//! 密钥轮换：调度策略、生命周期管理、后台调度与状态跟踪。

pub mod manager;
pub mod scheduler;
pub mod status;

use crate::error::Error;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 自动轮换的调度策略：轮询节奏、放弃超时与失败重试退避。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RotationPolicy {
    /// 调度器两次轮询之间的秒数。
    pub poll_interval_secs: u64,
    /// 单轮最多处理的到期密钥数量。
    pub batch_size: usize,
    /// `in_progress` 持续超过该秒数即视为被遗弃，可被重新认领。
    pub abandon_after_secs: u64,
    /// 失败后首次重试的退避秒数。
    pub retry_backoff_secs: u64,
    /// 退避的上限秒数。
    pub max_retry_backoff_secs: u64,
    /// 连续失败达到该次数时报告需要升级告警。
    pub escalation_threshold: u32,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            batch_size: 50,
            abandon_after_secs: 300,
            retry_backoff_secs: 60,
            max_retry_backoff_secs: 3600,
            escalation_threshold: 5,
        }
    }
}

impl RotationPolicy {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    /// 放弃超时，至少为三个轮询周期。
    pub fn abandonment_timeout(&self) -> Duration {
        let floor = self.poll_interval_secs.saturating_mul(3);
        secs(self.abandon_after_secs.max(floor))
    }

    /// 第 `consecutive_failures` 次连续失败后的重试延迟。
    ///
    /// 指数退避 `retry_backoff × 2^(n-1)`，不超过 `max_retry_backoff_secs`，
    /// 也不超过密钥自身的轮换间隔。
    pub fn retry_delay(&self, rotation_interval_secs: u64, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(20);
        let backoff = self
            .retry_backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_retry_backoff_secs)
            .min(rotation_interval_secs)
            .max(1);
        secs(backoff)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Configuration(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.retry_backoff_secs == 0 || self.max_retry_backoff_secs < self.retry_backoff_secs {
            return Err(Error::Configuration(
                "retry backoff must be positive and not exceed max_retry_backoff_secs".to_string(),
            ));
        }
        Ok(())
    }
}

/// 轮换的触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    Manual,
    Automatic,
}

impl RotationTrigger {
    pub fn is_manual(self) -> bool {
        matches!(self, RotationTrigger::Manual)
    }
}

impl fmt::Display for RotationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationTrigger::Manual => f.write_str("manual"),
            RotationTrigger::Automatic => f.write_str("automatic"),
        }
    }
}

pub(crate) fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

pub use self::manager::{CreateKeyRequest, KeyManager, RotationOutcome};
pub use self::scheduler::{RotationCycleReport, RotationScheduler, RotationSchedulerHandle};
pub use self::status::{ClaimedRotation, RotationStatusReport, RotationStatusTracker};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_is_bounded() {
        let policy = RotationPolicy {
            retry_backoff_secs: 10,
            max_retry_backoff_secs: 100,
            ..Default::default()
        };

        assert_eq!(policy.retry_delay(86_400, 1), Duration::seconds(10));
        assert_eq!(policy.retry_delay(86_400, 2), Duration::seconds(20));
        assert_eq!(policy.retry_delay(86_400, 3), Duration::seconds(40));
        assert_eq!(policy.retry_delay(86_400, 10), Duration::seconds(100));
        assert_eq!(policy.retry_delay(86_400, u32::MAX), Duration::seconds(100));
        // 不超过轮换间隔本身
        assert_eq!(policy.retry_delay(15, 3), Duration::seconds(15));
    }

    #[test]
    fn abandonment_timeout_spans_several_polls() {
        let policy = RotationPolicy {
            poll_interval_secs: 200,
            abandon_after_secs: 60,
            ..Default::default()
        };
        assert_eq!(policy.abandonment_timeout(), Duration::seconds(600));

        assert_eq!(
            RotationPolicy::default().abandonment_timeout(),
            Duration::seconds(300)
        );
    }

    #[test]
    fn validate_rejects_zero_values() {
        assert!(RotationPolicy::default().validate().is_ok());

        let policy = RotationPolicy {
            poll_interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(Error::Configuration(_))));

        let policy = RotationPolicy {
            retry_backoff_secs: 500,
            max_retry_backoff_secs: 100,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
