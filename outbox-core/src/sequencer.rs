//! 排序器（Sequencer）
//!
//! 为新插入、尚未排序的事件分配单调递增、无空洞的全局序号：
//! - 按插入顺序批量读取 pending 事件（批量上限避免积压时的大事务）；
//! - 从已分配的最大序号继续编号，冷启动时通过 `get_last_events(1)` 恢复；
//! - 整批序号一次原子写入，写入失败时不推进任何内存状态。
//!
use crate::error::{OutboxError, OutboxResult as Result};
use crate::event::{FIRST_SEQUENCE, SequenceAccessor};
use crate::store::EventStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct Sequencer<E> {
    store: Arc<dyn EventStore<E>>,
    accessor: SequenceAccessor<E>,
    batch_size: usize,
    // 下一个待分配序号；`None` 表示需从存储恢复。
    // 互斥锁同时保证同一时刻只有一个排序操作在进行。
    next: Mutex<Option<u64>>,
}

impl<E> Sequencer<E>
where
    E: Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn EventStore<E>>,
        accessor: SequenceAccessor<E>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            accessor,
            batch_size,
            next: Mutex::new(None),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 排序一批 pending 事件，返回本批分配的数量
    ///
    /// 返回值等于 `batch_size` 时说明可能仍有积压，调用方应立即再次调用。
    pub async fn assign_pending_sequences(&self) -> Result<usize> {
        let mut next = self.next.lock().await;

        let pending = self.store.get_unprocessed_events(self.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let start = match *next {
            Some(n) => n,
            None => self.recover_next().await?,
        };

        let count = pending.len();
        let assigned: Vec<E> = pending
            .into_iter()
            .zip(start..)
            .map(|(event, seq)| self.accessor.set(event, seq))
            .collect();

        match self.store.update_sequences(&assigned).await {
            Ok(()) => {
                *next = Some(start + count as u64);
                debug!(
                    assigned = count,
                    first = start,
                    last = start + count as u64 - 1,
                    "assigned event sequences"
                );
                Ok(count)
            }
            Err(err) => {
                // 写入结果未知（可能已提交），下次从持久状态重新恢复
                *next = None;
                Err(err)
            }
        }
    }

    /// 循环排序直到批次不满，返回总分配数量
    pub async fn assign_all_pending(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let count = self.assign_pending_sequences().await?;
            total += count;
            if count < self.batch_size {
                return Ok(total);
            }
        }
    }

    async fn recover_next(&self) -> Result<u64> {
        let last = self.store.get_last_events(1).await?;
        match last.last() {
            None => Ok(FIRST_SEQUENCE),
            Some(event) => match self.accessor.get(event) {
                0 => Err(OutboxError::invalid_state(
                    "last sequenced event reports sequence 0",
                )),
                seq => Ok(seq + 1),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, PublisherId};
    use crate::store::EventWriter;
    use crate::store_inmemory::InMemoryEventStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// 包装内存存储：可切换 update_sequences 失败，并统计写入次数
    #[derive(Clone, Default)]
    struct SpyStore {
        inner: InMemoryEventStore,
        fail_update: Arc<AtomicBool>,
        writes: Arc<AtomicUsize>,
        recoveries: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventStore<Event> for SpyStore {
        async fn get_unprocessed_events(&self, limit: usize) -> Result<Vec<Event>> {
            self.inner.get_unprocessed_events(limit).await
        }
        async fn update_sequences(&self, events: &[Event]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_update.load(Ordering::SeqCst) {
                return Err(OutboxError::store("update failed"));
            }
            self.inner.update_sequences(events).await
        }
        async fn get_events_from_sequence(&self, from: u64, limit: usize) -> Result<Vec<Event>> {
            self.inner.get_events_from_sequence(from, limit).await
        }
        async fn get_last_events(&self, limit: usize) -> Result<Vec<Event>> {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            self.inner.get_last_events(limit).await
        }
        async fn get_last_sequence(&self, publisher: PublisherId) -> Result<u64> {
            self.inner.get_last_sequence(publisher).await
        }
        async fn save_last_sequence(&self, publisher: PublisherId, sequence: u64) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.save_last_sequence(publisher, sequence).await
        }
    }

    fn sequencer(store: &SpyStore, batch: usize) -> Sequencer<Event> {
        Sequencer::new(
            Arc::new(store.clone()) as Arc<dyn EventStore<Event>>,
            SequenceAccessor::default(),
            batch,
        )
    }

    fn sequences(store: &SpyStore) -> Vec<Option<u64>> {
        store
            .inner
            .snapshot()
            .unwrap()
            .iter()
            .map(Event::sequence)
            .collect()
    }

    #[tokio::test]
    async fn three_pending_events_get_one_two_three() {
        let store = SpyStore::default();
        for n in 1..=3 {
            store.inner.insert_event(json!({ "e": n })).await.unwrap();
        }

        let s = sequencer(&store, 100);
        assert_eq!(s.assign_pending_sequences().await.unwrap(), 3);
        assert_eq!(sequences(&store), vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn empty_backlog_is_a_noop() {
        let store = SpyStore::default();
        let s = sequencer(&store, 100);
        assert_eq!(s.assign_pending_sequences().await.unwrap(), 0);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert_eq!(store.recoveries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn full_batches_are_drained_in_order() {
        let store = SpyStore::default();
        for n in 0..7 {
            store.inner.insert_event(json!({ "e": n })).await.unwrap();
        }

        let s = sequencer(&store, 3);
        assert_eq!(s.assign_pending_sequences().await.unwrap(), 3);
        assert_eq!(s.assign_all_pending().await.unwrap(), 4);
        let expected: Vec<_> = (1..=7).map(Some).collect();
        assert_eq!(sequences(&store), expected);
        // 只在冷启动时恢复一次
        assert_eq!(store.recoveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cold_start_continues_from_last_sequence() {
        let store = SpyStore::default();
        for n in 0..2 {
            store.inner.insert_event(json!({ "e": n })).await.unwrap();
        }
        sequencer(&store, 10).assign_all_pending().await.unwrap();

        store.inner.insert_event(json!({ "e": 2 })).await.unwrap();
        // 新实例没有内存提示
        let restarted = sequencer(&store, 10);
        assert_eq!(restarted.assign_pending_sequences().await.unwrap(), 1);
        assert_eq!(sequences(&store), vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn failed_write_does_not_advance_counter() {
        let store = SpyStore::default();
        store.inner.insert_event(json!({ "e": 0 })).await.unwrap();
        let s = sequencer(&store, 10);
        s.assign_pending_sequences().await.unwrap();

        store.inner.insert_event(json!({ "e": 1 })).await.unwrap();
        store.fail_update.store(true, Ordering::SeqCst);
        assert!(s.assign_pending_sequences().await.is_err());
        assert!(s.assign_pending_sequences().await.is_err());

        store.fail_update.store(false, Ordering::SeqCst);
        assert_eq!(s.assign_pending_sequences().await.unwrap(), 1);
        assert_eq!(sequences(&store), vec![Some(1), Some(2)]);
    }
}
