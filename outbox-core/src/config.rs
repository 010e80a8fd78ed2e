//! 引擎配置（CoreConfig）
//!
use crate::error::{OutboxError, OutboxResult};
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct CoreConfig {
    /// 某类任务（排序或某个订阅者）失败后的固定退避时长
    pub error_timeout: Duration,
    /// 无信号时的兜底轮询间隔
    pub poll_interval: Duration,
    /// 单批读取的 pending 事件上限
    pub sequence_batch_size: usize,
    /// 单次 `publish` 的事件上限
    pub dispatch_batch_size: usize,
    /// 同一轮次内并发分发的订阅者数量
    pub dispatch_concurrency: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            error_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(30),
            sequence_batch_size: 1000,
            dispatch_batch_size: 100,
            dispatch_concurrency: 8,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> OutboxResult<()> {
        if self.error_timeout.is_zero() {
            return Err(OutboxError::config("error_timeout must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(OutboxError::config("poll_interval must be positive"));
        }
        if self.sequence_batch_size == 0 {
            return Err(OutboxError::config("sequence_batch_size must be positive"));
        }
        if self.dispatch_batch_size == 0 {
            return Err(OutboxError::config("dispatch_batch_size must be positive"));
        }
        if self.dispatch_concurrency == 0 {
            return Err(OutboxError::config("dispatch_concurrency must be positive"));
        }
        Ok(())
    }
}
