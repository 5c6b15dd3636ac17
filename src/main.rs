//! new-boy: 微信消息机器人
//!
//! 架构:
//! - client: 客户端句柄接口 (WxClient) + 本机实现
//! - db: SQLCipher 本地库读取 (联系人 / 增量消息)
//! - sender: xdotool + 剪贴板驱动窗口发送
//! - message: 消息模型与类型映射
//! - listener: 后台消息监听 (日志输出)
//! - dispatcher: stdin JSON 命令 → stdout 响应
//! - logging / config

mod client;
mod config;
mod db;
mod dispatcher;
mod listener;
mod logging;
mod message;
mod sender;

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};

use crate::client::{LocalClient, WxClient};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Shutdown};
use crate::listener::{Listener, SEPARATOR};
use crate::logging::Logger;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    let logger = Logger::init(&config.log, &config.log_file())?;
    logger.scope(run(config, logger.clone())).await
}

async fn run(config: Config, logger: Logger) -> Result<()> {
    info!("🚀 new-boy v{} 启动中...", env!("CARGO_PKG_VERSION"));

    // ① 客户端 + 登录检查
    let client = match startup(&config).await {
        Ok(Some(client)) => client,
        Ok(None) => return Ok(()),
        Err(e) => {
            error!("程序启动失败: {e:#}");
            return Err(e);
        }
    };

    info!("机器人已启动，等待消息...");

    // ② 后台监听
    let listener = Listener::new(client.clone(), logger)
        .with_intervals(config.listener.poll_interval(), config.listener.error_backoff())
        .spawn();

    // ③ 前台命令分发
    let mut dispatcher = Dispatcher::new(Some(client), tokio::io::stdout());
    let stdin = BufReader::new(tokio::io::stdin());
    let outcome = tokio::select! {
        r = dispatcher.run(stdin) => Some(r),
        _ = tokio::signal::ctrl_c() => None,
    };

    let result = match outcome {
        Some(Ok(Shutdown::Exit)) => Ok(()),
        Some(Ok(Shutdown::EndOfInput)) => {
            info!("标准输入已关闭, 继续监听消息 (Ctrl-C 退出)");
            wait_for_ctrl_c(tokio::signal::ctrl_c()).await;
            info!("程序已停止");
            Ok(())
        }
        Some(Err(e)) => {
            error!("命令处理出错: {e:#}");
            Err(e)
        }
        None => {
            info!("程序已停止");
            listener.shutdown().await;
            // 挂起中的 stdin 读取会阻塞 runtime 退出
            std::process::exit(0);
        }
    };

    listener.shutdown().await;
    result
}

/// 注册失败时记录原因后直接返回
async fn wait_for_ctrl_c(signal: impl Future<Output = std::io::Result<()>>) {
    if let Err(e) = signal.await {
        error!("监听 Ctrl-C 失败: {e}");
    }
}

/// 构造客户端并完成启动检查; 未登录时返回 None
async fn startup(config: &Config) -> Result<Option<Arc<dyn WxClient>>> {
    let client: Arc<dyn WxClient> = Arc::new(LocalClient::open(&config.wechat)?);
    if prepare(client.as_ref()).await? {
        Ok(Some(client))
    } else {
        Ok(None)
    }
}

/// 登录检查 → 开启接收 → 打印账号信息
async fn prepare(client: &dyn WxClient) -> Result<bool> {
    if !client.is_login().await {
        error!("请先登录微信");
        return Ok(false);
    }

    if !client.is_receiving_msg().await {
        info!("启用消息接收功能...");
        client.enable_receiving_msg().await?;
    }

    log_login_info(client).await?;
    Ok(true)
}

async fn log_login_info(client: &dyn WxClient) -> Result<()> {
    info!("\n{SEPARATOR}");
    info!("登录账号信息：");

    let wxid = client.get_self_wxid().await?;
    let user = client.get_user_info().await?;
    info!("微信号: {wxid}");
    info!("昵称: {}", or_unknown(&user.name));
    info!("备注: {}", or_unknown(&user.remark));

    let friends = client.get_friends().await?;
    info!("好友数量: {}", friends.len());

    info!("{SEPARATOR}\n");
    Ok(())
}

fn or_unknown(s: &str) -> &str {
    if s.is_empty() { "未知" } else { s }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockClient;
    use crate::logging::capture::Captured;

    #[tokio::test]
    async fn not_logged_in_stops_before_loops() {
        let captured = Captured::default();
        let logger = Logger::with_writer("info", captured.clone());
        let client = MockClient::default();

        let ready = logger.scope(prepare(&client)).await.unwrap();

        assert!(!ready);
        assert!(!client.is_receiving_msg().await);
        assert!(captured.text().contains("请先登录微信"));
    }

    #[tokio::test]
    async fn logged_in_enables_receiving_and_logs_banner() {
        let captured = Captured::default();
        let logger = Logger::with_writer("info", captured.clone());
        let client = MockClient::logged_in();

        let ready = logger.scope(prepare(&client)).await.unwrap();

        assert!(ready);
        assert!(client.is_receiving_msg().await);
        let text = captured.text();
        assert!(text.contains("启用消息接收功能..."));
        assert!(text.contains("微信号: wxid_self"));
        assert!(text.contains("昵称: 机器人"));
        assert!(text.contains("备注: 未知"));
        assert!(text.contains("好友数量: 1"));
    }

    #[tokio::test]
    async fn already_receiving_skips_enable() {
        let captured = Captured::default();
        let logger = Logger::with_writer("info", captured.clone());
        let client = MockClient::logged_in();
        client.enable_receiving_msg().await.unwrap();

        logger.scope(prepare(&client)).await.unwrap();
        assert!(!captured.text().contains("启用消息接收功能"));
    }

    #[tokio::test]
    async fn ctrl_c_registration_failure_is_logged() {
        let captured = Captured::default();
        let logger = Logger::with_writer("info", captured.clone());
        let failed = std::future::ready(Err::<(), _>(std::io::Error::other("signal driver unavailable")));

        logger.scope(wait_for_ctrl_c(failed)).await;
        assert!(captured.text().contains("监听 Ctrl-C 失败: signal driver unavailable"));
    }

    #[tokio::test]
    async fn listener_keeps_running_after_end_of_input() {
        let captured = Captured::default();
        let logger = Logger::with_writer("info", captured.clone());
        let client = Arc::new(MockClient::logged_in());
        let shared: Arc<dyn WxClient> = client.clone();

        let handle = Listener::new(shared.clone(), logger)
            .with_intervals(std::time::Duration::from_millis(5), std::time::Duration::from_millis(5))
            .spawn();
        let mut dispatcher = Dispatcher::new(Some(shared), Vec::new());
        assert_eq!(dispatcher.run(&b""[..]).await.unwrap(), Shutdown::EndOfInput);

        client.push(Ok(Some(crate::message::InboundMessage::new("wxid_a", None, 1, "still here"))));
        for _ in 0..400 {
            if captured.text().contains("still here") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(captured.text().contains("消息内容: still here"));
        handle.shutdown().await;
    }
}
