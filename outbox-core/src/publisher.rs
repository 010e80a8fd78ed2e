//! 订阅者（Publisher）
//!
//! 外部实现的投递目标。投递语义为“至少一次、按序”：`publish` 在部分外部副作用后失败时，
//! 同一批次会在退避后整体重投，实现方需自行去重或保证幂等。
//!
use crate::event::PublisherId;
use async_trait::async_trait;

#[async_trait]
pub trait Publisher<E>: Send + Sync {
    /// 稳定标识（用于游标持久化，构造后不得变化）
    fn id(&self) -> PublisherId;

    /// 投递一批按序号升序排列的事件
    async fn publish(&self, events: &[E]) -> anyhow::Result<()>;
}
