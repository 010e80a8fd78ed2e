//! 事务发件箱（Outbox）排序与分发核心（outbox-core）
//!
//! 业务事务在同一次提交中写入一条未排序事件并调用 `signal()`，本 crate 负责后续的一切：
//! - 为 pending 事件分配单调递增、无空洞的全局序号（`sequencer`）；
//! - 按每个订阅者的持久游标，按序、至少一次地投递事件（`dispatcher`）；
//! - 可合并的唤醒信号 + 兜底定时器驱动的控制循环，按任务类别独立退避（`engine`）。
//!
//! 引擎通过注入的序号访问器对（`SequenceAccessor`）与具体事件类型解耦，
//! 通过 `EventStore` 协议与存储解耦；`InMemoryEventStore` 与（`infra-sqlx` 特性下的）
//! `PgEventStore` 为随库提供的实现。
//!
//! 典型用法：
//! 1. 实现或选用一个 `EventStore`，在业务事务中通过 `EventWriter` 插入事件；
//! 2. 实现若干 `Publisher`；
//! 3. `Core::builder()` 装配引擎并 `start()`，业务提交后调用 `signal()`。
//!
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
#[cfg(feature = "infra-sqlx")]
pub mod postgres;
pub mod publisher;
pub mod sequencer;
pub mod store;
pub mod store_inmemory;
pub mod wakeup;

pub use config::CoreConfig;
pub use engine::{Core, CoreHandle, ErrorLogger};
pub use error::{OutboxError, OutboxResult};
pub use event::{Event, EventId, PublisherId, SequenceAccessor};
pub use publisher::Publisher;
pub use store::{EventStore, EventWriter};
pub use store_inmemory::InMemoryEventStore;
pub use wakeup::{Signaler, Wakeup};
