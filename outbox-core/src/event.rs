//! 事件模型（Event）与序号访问器（SequenceAccessor）
//!
//! 引擎本身不要求事件实现任何固定接口：调用方注入一对纯函数
//! `get_sequence` / `set_sequence` 读写序号字段即可。
//! `Event` 是随库提供的默认表示，内存与 Postgres 存储均基于它实现。
//!
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// 首个分配的全局序号
pub const FIRST_SEQUENCE: u64 = 1;

/// 事件插入顺序标识（自增主键）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 订阅者（Publisher）的稳定标识，同时作为游标表的主键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublisherId(pub u64);

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct Event {
    /// 插入顺序标识
    id: EventId,
    /// 全局序号；`None` 表示尚未排序（pending）
    sequence: Option<u64>,
    /// 不透明负载
    data: Value,
    /// 写入时间
    created_at: DateTime<Utc>,
}

impl Event {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_pending(&self) -> bool {
        self.sequence.is_none()
    }

    /// 默认的读访问器：未排序事件返回 0
    pub fn get_sequence(event: &Event) -> u64 {
        event.sequence.unwrap_or(0)
    }

    /// 默认的写访问器
    pub fn set_sequence(mut event: Event, sequence: u64) -> Event {
        event.sequence = Some(sequence);
        event
    }
}

pub type GetSequence<E> = Arc<dyn Fn(&E) -> u64 + Send + Sync>;
pub type SetSequence<E> = Arc<dyn Fn(E, u64) -> E + Send + Sync>;

/// 注入的序号访问器对
///
/// `get` 对未排序事件应返回 0（序号从 [`FIRST_SEQUENCE`] 开始，0 永远不会被分配）。
pub struct SequenceAccessor<E> {
    get: GetSequence<E>,
    set: SetSequence<E>,
}

impl<E> SequenceAccessor<E> {
    pub fn new<G, S>(get: G, set: S) -> Self
    where
        G: Fn(&E) -> u64 + Send + Sync + 'static,
        S: Fn(E, u64) -> E + Send + Sync + 'static,
    {
        Self {
            get: Arc::new(get),
            set: Arc::new(set),
        }
    }

    pub fn get(&self, event: &E) -> u64 {
        (self.get)(event)
    }

    pub fn set(&self, event: E, sequence: u64) -> E {
        (self.set)(event, sequence)
    }
}

impl<E> Clone for SequenceAccessor<E> {
    fn clone(&self) -> Self {
        Self {
            get: self.get.clone(),
            set: self.set.clone(),
        }
    }
}

impl Default for SequenceAccessor<Event> {
    fn default() -> Self {
        Self::new(Event::get_sequence, Event::set_sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: u64) -> Event {
        Event::builder()
            .id(EventId(id))
            .data(serde_json::json!({"n": id}))
            .created_at(Utc::now())
            .build()
    }

    #[test]
    fn default_accessor_reads_zero_for_pending() {
        let accessor = SequenceAccessor::<Event>::default();
        let e = pending(1);
        assert!(e.is_pending());
        assert_eq!(accessor.get(&e), 0);

        let e = accessor.set(e, 7);
        assert_eq!(e.sequence(), Some(7));
        assert_eq!(accessor.get(&e), 7);
        assert_eq!(e.id(), EventId(1));
    }

    #[test]
    fn custom_accessor_over_foreign_type() {
        #[derive(Clone)]
        struct Row {
            seq: u64,
        }
        let accessor = SequenceAccessor::new(|r: &Row| r.seq, |mut r: Row, s| {
            r.seq = s;
            r
        });
        let r = accessor.set(Row { seq: 0 }, 42);
        assert_eq!(accessor.clone().get(&r), 42);
    }
}
