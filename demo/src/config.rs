use anyhow::{Context, Result};
use dotenvy::dotenv;
use outbox_core::CoreConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 从环境变量加载的演示配置
#[derive(Debug, Clone)]
pub struct Settings {
    pub core: CoreConfig,
    /// 模拟业务写入事件的间隔
    pub event_interval: Duration,
    /// 不稳定订阅者每 N 次投递失败一次（0 表示从不失败）
    pub flaky_fail_every: usize,
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn millis_or(key: &str, default: Duration) -> Result<Duration> {
    let ms = parse_or(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        // 开发环境下读取 .env（若存在）
        let _ = dotenv();

        let defaults = CoreConfig::default();
        let core = CoreConfig {
            error_timeout: millis_or("OUTBOX_ERROR_TIMEOUT_MS", defaults.error_timeout)?,
            poll_interval: millis_or("OUTBOX_POLL_INTERVAL_MS", defaults.poll_interval)?,
            sequence_batch_size: parse_or("OUTBOX_SEQUENCE_BATCH", defaults.sequence_batch_size)?,
            dispatch_batch_size: parse_or("OUTBOX_DISPATCH_BATCH", defaults.dispatch_batch_size)?,
            dispatch_concurrency: parse_or(
                "OUTBOX_DISPATCH_CONCURRENCY",
                defaults.dispatch_concurrency,
            )?,
        };

        Ok(Self {
            core,
            event_interval: millis_or("DEMO_EVENT_INTERVAL_MS", Duration::from_millis(500))?,
            flaky_fail_every: parse_or("DEMO_FLAKY_FAIL_EVERY", 3)?,
        })
    }
}
