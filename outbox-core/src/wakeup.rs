//! 唤醒信号（Wakeup）
//!
//! 非阻塞、可合并的“有新工作”信号：循环醒来之前无论调用多少次 `signal()`，
//! 都只会多触发一次处理轮次。基于 `tokio::sync::Notify` 的单许可语义实现。
//!
use std::sync::Arc;
use tokio::sync::Notify;

/// 业务侧依赖的信号接口：提交包含事件的事务后调用
pub trait Signaler: Send + Sync {
    fn signal(&self);
}

#[derive(Clone, Default)]
pub struct Wakeup {
    notify: Arc<Notify>,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    /// 标记有待处理的工作；从不阻塞，多次调用只保留一个许可
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// 等待下一个信号（若已有许可则立即返回并消耗它）
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Signaler for Wakeup {
    fn signal(&self) {
        Wakeup::signal(self);
    }
}
