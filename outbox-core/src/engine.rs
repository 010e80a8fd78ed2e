//! 事件引擎（Core）
//!
//! 统一编排“排序 → 分发”的长驻控制循环：
//! - 由唤醒信号、兜底定时器或启动触发一个处理轮次；
//! - 每轮先排序全部 pending 事件，再对各订阅者并发分发；
//! - 任务类别（排序 / 各订阅者）各自失败、各自退避，互不阻塞；
//! - 取消后允许当前轮次完成再退出，提供关闭与等待的 `CoreHandle`。
//!
use crate::config::CoreConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{OutboxError, OutboxResult};
use crate::event::{PublisherId, SequenceAccessor};
use crate::publisher::Publisher;
use crate::sequencer::Sequencer;
use crate::store::EventStore;
use crate::wakeup::{Signaler, Wakeup};
use bon::bon;
use futures_util::{StreamExt, stream};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 错误记录回调：`(message, error)`
pub type ErrorLogger = Arc<dyn Fn(&str, &OutboxError) + Send + Sync>;

fn default_error_logger() -> ErrorLogger {
    Arc::new(|message: &str, err: &OutboxError| error!(error = %err, "{message}"))
}

/// Core：
/// - 单实例单写者：只有它分配序号、推进游标
/// - `signal()` 与 `run()` 是对协作方暴露的唯一操作入口
pub struct Core<E> {
    publishers: Vec<Arc<dyn Publisher<E>>>,
    sequencer: Sequencer<E>,
    dispatcher: Dispatcher<E>,
    wakeup: Wakeup,
    config: CoreConfig,
    error_logger: ErrorLogger,
    // 同一个 Core 上至多一个控制循环
    running: AtomicBool,
}

#[bon]
impl<E> Core<E>
where
    E: Send + Sync + 'static,
{
    /// 构造时校验配置，非法配置直接返回 `OutboxError::Config`
    #[builder]
    pub fn new(
        event_store: Arc<dyn EventStore<E>>,
        accessor: SequenceAccessor<E>,
        #[builder(default)] publishers: Vec<Arc<dyn Publisher<E>>>,
        #[builder(default)] config: CoreConfig,
        error_logger: Option<ErrorLogger>,
    ) -> OutboxResult<Self> {
        config.validate()?;

        let mut ids = HashSet::with_capacity(publishers.len());
        for publisher in &publishers {
            if !ids.insert(publisher.id()) {
                return Err(OutboxError::config(format!(
                    "duplicate publisher id {}",
                    publisher.id()
                )));
            }
        }

        Ok(Self {
            sequencer: Sequencer::new(
                event_store.clone(),
                accessor.clone(),
                config.sequence_batch_size,
            ),
            dispatcher: Dispatcher::new(event_store, accessor, config.dispatch_batch_size),
            publishers,
            wakeup: Wakeup::new(),
            config,
            error_logger: error_logger.unwrap_or_else(default_error_logger),
            running: AtomicBool::new(false),
        })
    }
}

impl<E> Core<E>
where
    E: Send + Sync + 'static,
{
    /// 请求尽快执行一个处理轮次；非阻塞、可合并
    pub fn signal(&self) {
        self.wakeup.signal();
    }

    /// 可交给业务侧持有的信号句柄
    pub fn wakeup(&self) -> Wakeup {
        self.wakeup.clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// 控制循环是否正在运行
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 控制循环，阻塞直到 `token` 被取消
    ///
    /// 同一个 Core 上已有循环在运行时立即返回 `OutboxError::InvalidState`。
    pub async fn run(&self, token: CancellationToken) -> OutboxResult<()> {
        let _running = RunningGuard::acquire(&self.running)?;
        info!(publishers = self.publishers.len(), "outbox core started");
        let mut backoff = Backoff::new(self.config.error_timeout);

        while !token.is_cancelled() {
            self.process(&mut backoff).await;

            let poll_deadline = Instant::now() + self.config.poll_interval;
            let deadline = backoff
                .next_deadline()
                .map_or(poll_deadline, |d| d.min(poll_deadline));

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = time::sleep_until(deadline) => {}
            }
        }

        info!("outbox core stopped");
        Ok(())
    }

    /// 在当前 tokio 运行时上启动控制循环，返回用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> CoreHandle<E> {
        let token = CancellationToken::new();
        let task = {
            let core = self.clone();
            let token = token.clone();
            tokio::spawn(async move { core.run(token).await })
        };

        CoreHandle {
            core: self,
            token,
            task: Some(task),
        }
    }

    async fn process(&self, backoff: &mut Backoff) {
        if backoff.is_ready(&TaskCategory::Sequencing) {
            match self.sequencer.assign_all_pending().await {
                Ok(assigned) => {
                    backoff.clear(&TaskCategory::Sequencing);
                    if assigned > 0 {
                        debug!(assigned, "sequencing pass finished");
                    }
                }
                Err(err) => {
                    (self.error_logger)("failed to assign event sequences", &err);
                    backoff.trip(TaskCategory::Sequencing);
                }
            }
        }

        let ready: Vec<Arc<dyn Publisher<E>>> = self
            .publishers
            .iter()
            .filter(|p| backoff.is_ready(&TaskCategory::Publisher(p.id())))
            .cloned()
            .collect();

        let dispatcher = &self.dispatcher;
        let passes: Vec<_> = ready
            .into_iter()
            .map(|publisher| async move {
                let id = publisher.id();
                (id, dispatcher.dispatch_once(publisher.as_ref()).await)
            })
            .collect();
        let results: Vec<(PublisherId, OutboxResult<usize>)> = stream::iter(passes)
            .buffer_unordered(self.config.dispatch_concurrency)
            .collect()
            .await;

        for (id, result) in results {
            let category = TaskCategory::Publisher(id);
            match result {
                Ok(delivered) => {
                    backoff.clear(&category);
                    if delivered > 0 {
                        debug!(publisher = %id, delivered, "dispatch pass finished");
                    }
                }
                Err(err) => {
                    (self.error_logger)(&format!("failed to dispatch to publisher {id}"), &err);
                    backoff.trip(category);
                }
            }
        }
    }
}

impl<E> Signaler for Core<E>
where
    E: Send + Sync + 'static,
{
    fn signal(&self) {
        Core::signal(self);
    }
}

/// 占用运行标记，离开作用域（包括被取消或 panic）时释放
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> OutboxResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| OutboxError::invalid_state("outbox core is already running"))?;
        Ok(Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 退避的任务类别：排序整体一类，每个订阅者各一类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum TaskCategory {
    Sequencing,
    Publisher(PublisherId),
}

/// 各任务类别的退避截止时间（仅控制循环内部使用）
struct Backoff {
    timeout: Duration,
    until: HashMap<TaskCategory, Instant>,
}

impl Backoff {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            until: HashMap::new(),
        }
    }

    fn is_ready(&self, category: &TaskCategory) -> bool {
        self.until
            .get(category)
            .is_none_or(|until| Instant::now() >= *until)
    }

    fn trip(&mut self, category: TaskCategory) {
        self.until.insert(category, Instant::now() + self.timeout);
    }

    fn clear(&mut self, category: &TaskCategory) {
        self.until.remove(category);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.until.values().min().copied()
    }
}

/// 运行句柄：用于信号、优雅关闭与等待循环结束
pub struct CoreHandle<E>
where
    E: Send + Sync + 'static,
{
    core: Arc<Core<E>>,
    token: CancellationToken,
    task: Option<JoinHandle<OutboxResult<()>>>,
}

impl<E> CoreHandle<E>
where
    E: Send + Sync + 'static,
{
    pub fn core(&self) -> &Arc<Core<E>> {
        &self.core
    }

    pub fn signal(&self) {
        self.core.signal();
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// 等待控制循环退出（当前轮次会先完成），返回循环本身的结果
    pub async fn join(mut self) -> OutboxResult<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "outbox core task terminated abnormally");
                Err(OutboxError::invalid_state(format!(
                    "outbox core task terminated abnormally: {err}"
                )))
            }
        }
    }
}

impl<E> Signaler for CoreHandle<E>
where
    E: Send + Sync + 'static,
{
    fn signal(&self) {
        CoreHandle::signal(self);
    }
}

impl<E> Drop for CoreHandle<E>
where
    E: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
