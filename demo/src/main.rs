mod config;

use anyhow::Result;
use async_trait::async_trait;
use config::Settings;
use outbox_core::{
    Core, Event, EventStore, EventWriter, InMemoryEventStore, Publisher, PublisherId,
    SequenceAccessor, Signaler,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// 把每条事件打到日志里的订阅者
struct LogPublisher;

#[async_trait]
impl Publisher<Event> for LogPublisher {
    fn id(&self) -> PublisherId {
        PublisherId(1)
    }

    async fn publish(&self, events: &[Event]) -> anyhow::Result<()> {
        for event in events {
            info!(
                sequence = ?event.sequence(),
                id = %event.id(),
                data = %event.data(),
                "published"
            );
        }
        Ok(())
    }
}

/// 每 N 次投递失败一次的订阅者，按最后确认的序号去重
struct FlakyPublisher {
    fail_every: usize,
    calls: AtomicUsize,
    acked: AtomicU64,
}

#[async_trait]
impl Publisher<Event> for FlakyPublisher {
    fn id(&self) -> PublisherId {
        PublisherId(2)
    }

    async fn publish(&self, events: &[Event]) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = self.fail_every > 0 && call % self.fail_every == 0;

        for seq in events.iter().filter_map(Event::sequence) {
            if seq <= self.acked.load(Ordering::SeqCst) {
                warn!(sequence = seq, "flaky publisher skipped duplicate");
                continue;
            }
            // 先产生外部副作用再失败，重投时前面的事件会被当作重复跳过
            self.acked.store(seq, Ordering::SeqCst);
            if fail {
                anyhow::bail!("flaky downstream failed after sequence {seq}");
            }
        }

        let last = self.acked.load(Ordering::SeqCst);
        info!(events = events.len(), acked = last, "flaky publisher acknowledged");
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,outbox_core=debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 模拟业务事务：写入一条事件后发出信号
async fn simulate_business(
    writer: impl EventWriter,
    signaler: impl Signaler,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut n: u64 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                n += 1;
                match writer.insert_event(json!({ "kind": "todo.saved", "todo_id": n })).await {
                    Ok(id) => {
                        info!(%id, "business transaction committed");
                        signaler.signal();
                    }
                    Err(err) => warn!(error = %err, "business transaction failed"),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let settings = Settings::from_env()?;
    info!(?settings, "starting outbox demo");

    let store = InMemoryEventStore::new();
    let core = Arc::new(
        Core::builder()
            .event_store(Arc::new(store.clone()) as Arc<dyn EventStore<Event>>)
            .accessor(SequenceAccessor::new(Event::get_sequence, Event::set_sequence))
            .publishers(vec![
                Arc::new(LogPublisher) as Arc<dyn Publisher<Event>>,
                Arc::new(FlakyPublisher {
                    fail_every: settings.flaky_fail_every,
                    calls: AtomicUsize::new(0),
                    acked: AtomicU64::new(0),
                }) as Arc<dyn Publisher<Event>>,
            ])
            .config(settings.core)
            .build()?,
    );

    let wakeup = core.wakeup();
    let handle = core.start();
    handle.signal();

    let business_token = CancellationToken::new();
    let business = tokio::spawn(simulate_business(
        store.clone(),
        wakeup,
        settings.event_interval,
        business_token.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    business_token.cancel();
    let _ = business.await;
    handle.shutdown();
    handle.join().await?;

    info!(pending = store.pending_count()?, "graceful shutdown completed");
    Ok(())
}
