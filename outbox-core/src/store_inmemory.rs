//! 内存版事件存储（InMemoryEventStore）
//!
//! 基于 `std::sync::Mutex` 的完整 `EventStore<Event>` + `EventWriter` 实现：
//! - 事件按插入顺序保存，另以 `BTreeMap` 维护序号索引，保证序号唯一；
//! - `update_sequences` 先整体校验再写入，保证批次原子性；
//! - 典型用途：测试环境、示例与本地开发。
//!
use crate::error::{OutboxError, OutboxResult as Result};
use crate::event::{Event, EventId, PublisherId};
use crate::store::{EventStore, EventWriter};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    by_sequence: BTreeMap<u64, usize>,
    cursors: HashMap<PublisherId, u64>,
    next_id: u64,
}

impl Inner {
    fn index_of(&self, id: EventId) -> Option<usize> {
        self.events.binary_search_by_key(&id, Event::id).ok()
    }
}

#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| OutboxError::store("in-memory store lock poisoned"))
    }

    /// 当前全部事件的快照（按插入顺序）
    pub fn snapshot(&self) -> Result<Vec<Event>> {
        Ok(self.lock()?.events.clone())
    }

    /// 未排序事件数量
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.lock()?.events.iter().filter(|e| e.is_pending()).count())
    }
}

#[async_trait]
impl EventWriter for InMemoryEventStore {
    async fn insert_event(&self, data: Value) -> Result<EventId> {
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = EventId(inner.next_id);
        inner.events.push(
            Event::builder()
                .id(id)
                .data(data)
                .created_at(Utc::now())
                .build(),
        );
        Ok(id)
    }
}

#[async_trait]
impl EventStore<Event> for InMemoryEventStore {
    async fn get_unprocessed_events(&self, limit: usize) -> Result<Vec<Event>> {
        let inner = self.lock()?;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_sequences(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut inner = self.lock()?;

        // 先整体校验，任何一条不合法则整批不落盘
        let mut staged = Vec::with_capacity(events.len());
        let mut seen = BTreeMap::new();
        for event in events {
            let Some(sequence) = event.sequence() else {
                return Err(OutboxError::invalid_state(format!(
                    "event {} has no sequence to persist",
                    event.id()
                )));
            };
            let Some(idx) = inner.index_of(event.id()) else {
                return Err(OutboxError::store(format!("event {} not found", event.id())));
            };
            if !inner.events[idx].is_pending() {
                return Err(OutboxError::invalid_state(format!(
                    "event {} is already sequenced",
                    event.id()
                )));
            }
            if inner.by_sequence.contains_key(&sequence) || seen.insert(sequence, idx).is_some() {
                return Err(OutboxError::invalid_state(format!(
                    "sequence {sequence} is already assigned"
                )));
            }
            staged.push((idx, sequence));
        }

        for (idx, sequence) in staged {
            let event = inner.events[idx].clone();
            inner.events[idx] = Event::set_sequence(event, sequence);
            inner.by_sequence.insert(sequence, idx);
        }
        Ok(())
    }

    async fn get_events_from_sequence(&self, from: u64, limit: usize) -> Result<Vec<Event>> {
        let inner = self.lock()?;
        Ok(inner
            .by_sequence
            .range(from..)
            .take(limit)
            .map(|(_, idx)| inner.events[*idx].clone())
            .collect())
    }

    async fn get_last_events(&self, limit: usize) -> Result<Vec<Event>> {
        let inner = self.lock()?;
        let mut events: Vec<Event> = inner
            .by_sequence
            .values()
            .rev()
            .take(limit)
            .map(|idx| inner.events[*idx].clone())
            .collect();
        events.reverse();
        Ok(events)
    }

    async fn get_last_sequence(&self, publisher: PublisherId) -> Result<u64> {
        Ok(self.lock()?.cursors.get(&publisher).copied().unwrap_or(0))
    }

    async fn save_last_sequence(&self, publisher: PublisherId, sequence: u64) -> Result<()> {
        // 游标只前进不后退
        self.lock()?
            .cursors
            .entry(publisher)
            .and_modify(|cursor| *cursor = (*cursor).max(sequence))
            .or_insert(sequence);
        Ok(())
    }
}
