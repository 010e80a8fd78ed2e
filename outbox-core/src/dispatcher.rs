//! 分发器（Dispatcher）
//!
//! 对单个订阅者：从其持久游标之后按序读取已排序事件并投递，仅在投递成功后推进游标。
//! 失败时游标保持不变，错误原样返回给调用方，由引擎负责退避重试。
//!
use crate::error::{OutboxError, OutboxResult as Result};
use crate::event::SequenceAccessor;
use crate::publisher::Publisher;
use crate::store::EventStore;
use std::sync::Arc;
use tracing::debug;

pub struct Dispatcher<E> {
    store: Arc<dyn EventStore<E>>,
    accessor: SequenceAccessor<E>,
    batch_size: usize,
}

impl<E> Dispatcher<E>
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
        }
    }

    /// 对一个订阅者执行一次分发，返回投递的事件数
    ///
    /// 批次满时继续读取下一批，直到积压清空或出错。
    pub async fn dispatch_once(&self, publisher: &dyn Publisher<E>) -> Result<usize> {
        let id = publisher.id();
        let mut cursor = self.store.get_last_sequence(id).await?;
        let mut delivered = 0;

        loop {
            let batch = self
                .store
                .get_events_from_sequence(cursor + 1, self.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };

            let last = self.accessor.get(last);
            if last <= cursor {
                return Err(OutboxError::invalid_state(format!(
                    "batch for publisher {id} ends at {last}, not past cursor {cursor}"
                )));
            }

            publisher
                .publish(&batch)
                .await
                .map_err(|err| OutboxError::Publish {
                    publisher: id,
                    reason: format!("{err:#}"),
                })?;

            self.store.save_last_sequence(id, last).await?;
            debug!(publisher = %id, events = batch.len(), cursor = last, "delivered batch");

            cursor = last;
            delivered += batch.len();
            if batch.len() < self.batch_size {
                break;
            }
        }

        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, PublisherId};
    use crate::sequencer::Sequencer;
    use crate::store::EventWriter;
    use crate::store_inmemory::InMemoryEventStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Clone, Default)]
    struct CursorSpy {
        inner: InMemoryEventStore,
        saved: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl EventStore<Event> for CursorSpy {
        async fn get_unprocessed_events(&self, limit: usize) -> Result<Vec<Event>> {
            self.inner.get_unprocessed_events(limit).await
        }
        async fn update_sequences(&self, events: &[Event]) -> Result<()> {
            self.inner.update_sequences(events).await
        }
        async fn get_events_from_sequence(&self, from: u64, limit: usize) -> Result<Vec<Event>> {
            self.inner.get_events_from_sequence(from, limit).await
        }
        async fn get_last_events(&self, limit: usize) -> Result<Vec<Event>> {
            self.inner.get_last_events(limit).await
        }
        async fn get_last_sequence(&self, publisher: PublisherId) -> Result<u64> {
            self.inner.get_last_sequence(publisher).await
        }
        async fn save_last_sequence(&self, publisher: PublisherId, sequence: u64) -> Result<()> {
            self.saved.lock().unwrap().push(sequence);
            self.inner.save_last_sequence(publisher, sequence).await
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        fail: AtomicBool,
        batches: Mutex<Vec<Vec<u64>>>,
    }

    #[async_trait]
    impl Publisher<Event> for RecordingPublisher {
        fn id(&self) -> PublisherId {
            PublisherId(1)
        }
        async fn publish(&self, events: &[Event]) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("downstream unavailable");
            }
            let seqs = events.iter().filter_map(Event::sequence).collect();
            self.batches.lock().unwrap().push(seqs);
            Ok(())
        }
    }

    async fn sequenced_store(n: usize) -> CursorSpy {
        let store = CursorSpy::default();
        for i in 0..n {
            store.inner.insert_event(json!({ "i": i })).await.unwrap();
        }
        Sequencer::new(
            Arc::new(store.inner.clone()) as Arc<dyn EventStore<Event>>,
            SequenceAccessor::default(),
            1000,
        )
        .assign_all_pending()
        .await
        .unwrap();
        store
    }

    fn dispatcher(store: &CursorSpy, batch: usize) -> Dispatcher<Event> {
        Dispatcher::new(
            Arc::new(store.clone()) as Arc<dyn EventStore<Event>>,
            SequenceAccessor::default(),
            batch,
        )
    }

    #[tokio::test]
    async fn delivers_everything_after_cursor_in_one_call() {
        let store = sequenced_store(3).await;
        let publisher = RecordingPublisher::default();

        let delivered = dispatcher(&store, 10).dispatch_once(&publisher).await.unwrap();
        assert_eq!(delivered, 3);
        assert_eq!(*publisher.batches.lock().unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(store.inner.get_last_sequence(PublisherId(1)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn full_batches_keep_draining_and_cursor_only_moves_forward() {
        let store = sequenced_store(5).await;
        let publisher = RecordingPublisher::default();

        let delivered = dispatcher(&store, 2).dispatch_once(&publisher).await.unwrap();
        assert_eq!(delivered, 5);
        assert_eq!(
            *publisher.batches.lock().unwrap(),
            vec![vec![1, 2], vec![3, 4], vec![5]]
        );
        assert_eq!(*store.saved.lock().unwrap(), vec![2, 4, 5]);
    }

    #[tokio::test]
    async fn failure_keeps_cursor_and_redelivers_same_batch() {
        let store = sequenced_store(3).await;
        let publisher = RecordingPublisher::default();
        publisher.fail.store(true, Ordering::SeqCst);

        let d = dispatcher(&store, 10);
        let err = d.dispatch_once(&publisher).await.unwrap_err();
        assert!(matches!(err, OutboxError::Publish { publisher: PublisherId(1), .. }));
        assert!(store.saved.lock().unwrap().is_empty());

        publisher.fail.store(false, Ordering::SeqCst);
        assert_eq!(d.dispatch_once(&publisher).await.unwrap(), 3);
        assert_eq!(*publisher.batches.lock().unwrap(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn nothing_to_deliver_writes_nothing() {
        let store = sequenced_store(0).await;
        let publisher = RecordingPublisher::default();

        assert_eq!(dispatcher(&store, 10).dispatch_once(&publisher).await.unwrap(), 0);
        assert!(publisher.batches.lock().unwrap().is_empty());
        assert!(store.saved.lock().unwrap().is_empty());
    }
}
