//! 重新投递退避策略
//!
//! 可重试失败不在业务代码内部循环重试，而是交还给消费端回退 offset 重新投递。
//! 本模块只负责回答两个问题：还能不能再投递、下一次投递前等多久。

use std::time::Duration;

// ---------------------------------------------------------------------------
// RetryPolicy：退避策略配置
// ---------------------------------------------------------------------------

/// 退避策略配置
///
/// 使用指数退避避免重试风暴：首次重新投递前等 initial_delay，
/// 之后每次乘以 multiplier，直到达到最大间隔或最大重试次数。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重新投递次数（不含首次投递）
    pub max_retries: u32,
    /// 首次重新投递前的等待时间
    pub initial_delay: Duration,
    /// 退避时间上限
    pub max_delay: Duration,
    /// 每次重新投递的退避倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 默认策略：最多重新投递 3 次，初始等待 100 毫秒，最大等待 5 秒，倍数 2.0
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 计算第 N 次重新投递的等待时间（attempt 从 0 开始）
    ///
    /// 公式: initial_delay * multiplier^attempt，结果不超过 max_delay。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// 是否应继续重新投递
    ///
    /// attempt 表示已经失败的次数，当 attempt < max_retries 时返回 true。
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
