//! 日志
//!
//! Logger 持有一个 tracing Dispatch (控制台 + 日志文件两路输出),
//! 在 main 中构造后显式传给监听任务和命令分发器, 不安装全局 subscriber。

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::future::Future;
use std::path::Path;
use std::sync::Mutex;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::Dispatch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;

const DEFAULT_FILTER: &str = "new_boy=info";

#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
}

impl Logger {
    /// 控制台 (stderr) + 追加写入 `log_file`
    ///
    /// stdout 留给命令响应, 日志不写 stdout。
    pub fn init(config: &LogConfig, log_file: &Path) -> Result<Self> {
        if let Some(dir) = log_file.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("创建日志目录失败: {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("打开日志文件失败: {}", log_file.display()))?;

        let filter = build_filter(config.filter.as_deref());

        let console = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .without_time()
            .with_target(false);

        let file_layer = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .without_time()
                .with_target(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file_layer);
        Ok(Self { dispatch: Dispatch::new(subscriber) })
    }

    /// 单路输出, 不带 ANSI (测试捕获日志用)
    #[cfg(test)]
    pub fn with_writer<W>(filter: &str, writer: W) -> Self
    where
        W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
    {
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(filter))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .without_time()
                    .with_target(false),
            );
        Self { dispatch: Dispatch::new(subscriber) }
    }

    #[cfg(test)]
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// 让 future 在本 Logger 下运行 (跨线程调度也有效)
    pub fn scope<F: Future>(&self, fut: F) -> WithDispatch<F> {
        fut.with_subscriber(self.dispatch.clone())
    }
}

/// 配置 > RUST_LOG > 默认
fn build_filter(configured: Option<&str>) -> EnvFilter {
    match configured {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()),
    }
}

/// 把当前 dispatch 带进 spawn_blocking 闭包
pub fn spawn_blocking_scoped<F, R>(f: F) -> tokio::task::JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    tokio::task::spawn_blocking(move || tracing::dispatcher::with_default(&dispatch, f))
}
