//! 事件存储（EventStore）协议
//!
//! 只追加的事件表与每个订阅者的游标表。核心引擎只通过该协议读写持久状态，
//! 具体后端（内存、Postgres 等）由上层注入。
//!
use crate::error::OutboxResult as Result;
use crate::event::{EventId, PublisherId};
use async_trait::async_trait;
use serde_json::Value;

/// 核心引擎消费的存储读写
#[async_trait]
pub trait EventStore<E>: Send + Sync {
    /// 未排序事件，按插入顺序升序，至多 `limit` 条
    async fn get_unprocessed_events(&self, limit: usize) -> Result<Vec<E>>;

    /// 原子地持久化一批已分配的序号；空批次为 no-op
    async fn update_sequences(&self, events: &[E]) -> Result<()>;

    /// `sequence >= from` 的已排序事件，按序号升序，至多 `limit` 条
    async fn get_events_from_sequence(&self, from: u64, limit: usize) -> Result<Vec<E>>;

    /// 最近排序的 `limit` 条事件（按序号升序返回），用于冷启动恢复最大序号
    async fn get_last_events(&self, limit: usize) -> Result<Vec<E>>;

    /// 订阅者游标；不存在时返回 0 而不是错误
    async fn get_last_sequence(&self, publisher: PublisherId) -> Result<u64>;

    /// 幂等地写入订阅者游标
    async fn save_last_sequence(&self, publisher: PublisherId, sequence: u64) -> Result<()>;
}

/// 业务事务侧的写入边界：在业务提交中插入一条未排序事件
#[async_trait]
pub trait EventWriter: Send + Sync {
    async fn insert_event(&self, data: Value) -> Result<EventId>;
}
