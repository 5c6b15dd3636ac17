//! 后台消息监听
//!
//! 轮询 WxClient::get_msg, 每条消息输出一段固定格式的日志记录。
//! 暂无消息时短暂休眠; 出错时记录并退避后继续; 只有停止信号能结束循环。

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::client::WxClient;
use crate::logging::Logger;
use crate::message::{app_message_title, msg_type_label, InboundMessage, MsgType};

pub const SEPARATOR: &str = "==================================================";

/// 群聊附加信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub room_name: String,
    pub sender_nickname: String,
}

/// 一条消息的日志行 (不含前后分隔)
pub fn render_lines(msg: &InboundMessage, group: Option<&GroupInfo>) -> Vec<String> {
    let mut lines = vec![
        "收到新消息:".to_string(),
        format!("时间: {}", msg.received_at.format("%Y-%m-%d %H:%M:%S")),
    ];
    if let Some(room_id) = msg.room_id() {
        lines.push(format!("群ID: {room_id}"));
    }
    lines.push(format!("发送者: {}", msg.sender));
    lines.push(format!("消息类型: {}", msg_type_label(msg.msg_type)));
    lines.push(format!("消息内容: {}", msg.content));
    if msg.kind() == MsgType::App {
        if let Some(title) = app_message_title(&msg.content) {
            lines.push(format!("应用消息标题: {title}"));
        }
    }
    if let Some(g) = group {
        lines.push(format!("群名称: {}", g.room_name));
        lines.push(format!("发送者昵称: {}", g.sender_nickname));
    }
    lines
}

pub struct Listener {
    client: Arc<dyn WxClient>,
    logger: Logger,
    poll_interval: Duration,
    error_backoff: Duration,
}

/// 运行中的监听任务
pub struct ListenerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// 发出停止信号并等待任务退出
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!("消息监听任务异常退出: {e}");
        }
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Listener {
    pub fn new(client: Arc<dyn WxClient>, logger: Logger) -> Self {
        Self {
            client,
            logger,
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_intervals(mut self, poll_interval: Duration, error_backoff: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.error_backoff = error_backoff;
        self
    }

    /// 在后台任务中运行
    pub fn spawn(self) -> ListenerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let logger = self.logger.clone();
        let task = tokio::spawn(logger.scope(self.run(stop_rx)));
        ListenerHandle { stop, task }
    }

    /// 主循环, 直到收到停止信号 (或停止端被丢弃)
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!("消息监听已启动，等待新消息...");
        loop {
            if *stop.borrow() {
                break;
            }
            let polled = tokio::select! {
                r = self.poll_once() => r,
                _ = stop.changed() => break,
            };
            let delay = match polled {
                Ok(true) => continue,
                Ok(false) => self.poll_interval,
                Err(e) => {
                    error!("消息监听出错: {e:#}");
                    self.error_backoff
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }
        info!("消息监听已停止");
    }

    /// 处理一条消息; 返回是否取到了消息
    async fn poll_once(&self) -> Result<bool> {
        let Some(msg) = self.client.get_msg().await? else {
            return Ok(false);
        };

        let group = match msg.room_id() {
            Some(room_id) => Some(self.resolve_group(&msg.sender, room_id).await),
            None => None,
        };
        let resolved = match &group {
            Some(Ok(g)) => Some(g),
            _ => None,
        };

        info!("\n{SEPARATOR}");
        for line in render_lines(&msg, resolved) {
            info!("{line}");
        }
        info!("{SEPARATOR}\n");

        match group {
            Some(Err(e)) => Err(e),
            _ => Ok(true),
        }
    }

    async fn resolve_group(&self, sender: &str, room_id: &str) -> Result<GroupInfo> {
        let room_name = self.client.get_room_name(room_id).await?;
        let sender_nickname = self.client.get_room_member_nickname(sender, room_id).await?;
        Ok(GroupInfo { room_name, sender_nickname })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockClient;
    use crate::logging::capture::Captured;
    use anyhow::anyhow;

    fn listener(client: Arc<MockClient>) -> (Listener, Captured) {
        let captured = Captured::default();
        let logger = Logger::with_writer("info", captured.clone());
        let listener = Listener::new(client, logger)
            .with_intervals(Duration::from_millis(5), Duration::from_millis(5));
        (listener, captured)
    }

    /// 等到 cond 成立 (最多 2 秒)
    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn renders_direct_message_record() {
        let msg = InboundMessage::new("wxid_a", None, 1, "你好");
        let lines = render_lines(&msg, None);
        assert_eq!(lines[0], "收到新消息:");
        assert!(lines[1].starts_with("时间: "));
        assert_eq!(&lines[2..], ["发送者: wxid_a", "消息类型: 文本消息", "消息内容: 你好"]);
    }

    #[test]
    fn renders_group_and_app_lines() {
        let xml = "<msg><appmsg><title>分享</title></appmsg></msg>";
        let msg = InboundMessage::new("wxid_b", Some("1@chatroom".into()), 49, xml);
        let group = GroupInfo { room_name: "技术群".into(), sender_nickname: "小B".into() };
        let lines = render_lines(&msg, Some(&group));
        assert_eq!(lines[2], "群ID: 1@chatroom");
        assert!(lines.contains(&"消息类型: 应用消息".to_string()));
        assert!(lines.contains(&"应用消息标题: 分享".to_string()));
        assert_eq!(&lines[lines.len() - 2..], ["群名称: 技术群", "发送者昵称: 小B"]);
    }

    #[test]
    fn renders_unknown_type_label() {
        let msg = InboundMessage::new("wxid_a", None, 9999, "?");
        assert!(render_lines(&msg, None).contains(&"消息类型: 未知类型(9999)".to_string()));
    }

    #[tokio::test]
    async fn logs_direct_message_without_group_lookups() {
        let client = Arc::new(MockClient::logged_in());
        client.push(Ok(Some(InboundMessage::new("wxid_a", Some("wxid_a".into()), 1, "在吗"))));
        let (listener, captured) = listener(client.clone());

        let handle = listener.spawn();
        wait_until(|| captured.text().contains("消息内容: 在吗")).await;
        handle.shutdown().await;

        let text = captured.text();
        assert!(text.contains("发送者: wxid_a"));
        assert!(!text.contains("群名称"));
        assert_eq!(MockClient::count(&client.room_name_calls), 0);
        assert_eq!(MockClient::count(&client.nickname_calls), 0);
    }

    #[tokio::test]
    async fn group_message_triggers_two_lookups() {
        let client = Arc::new(MockClient::logged_in());
        client.push(Ok(Some(InboundMessage::new("wxid_b", Some("7@chatroom".into()), 1, "hi"))));
        let (listener, captured) = listener(client.clone());

        let handle = listener.spawn();
        wait_until(|| captured.text().contains("发送者昵称")).await;
        handle.shutdown().await;

        let text = captured.text();
        assert!(text.contains("群ID: 7@chatroom"));
        assert!(text.contains("群名称: 群<7@chatroom>"));
        assert!(text.contains("发送者昵称: 昵称<wxid_b>"));
        assert_eq!(MockClient::count(&client.room_name_calls), 1);
        assert_eq!(MockClient::count(&client.nickname_calls), 1);
    }

    #[tokio::test]
    async fn errors_are_logged_and_loop_continues() {
        let client = Arc::new(MockClient::logged_in());
        client.push(Err(anyhow!("pipe closed")));
        client.push(Ok(Some(InboundMessage::new("wxid_a", None, 1, "after error"))));
        let (listener, captured) = listener(client.clone());

        let handle = listener.spawn();
        wait_until(|| captured.text().contains("after error")).await;
        assert!(!handle.is_finished());
        handle.shutdown().await;

        assert!(captured.text().contains("消息监听出错: pipe closed"));
    }

    #[tokio::test]
    async fn failed_group_lookup_still_logs_message() {
        let client = Arc::new(MockClient { fail_lookups: true, ..MockClient::logged_in() });
        client.push(Ok(Some(InboundMessage::new("wxid_b", Some("8@chatroom".into()), 1, "lost?"))));
        let (listener, captured) = listener(client.clone());

        let handle = listener.spawn();
        wait_until(|| captured.text().contains("消息监听出错")).await;
        handle.shutdown().await;

        let text = captured.text();
        assert!(text.contains("消息内容: lost?"));
        assert!(!text.contains("群名称"));
    }

    #[tokio::test]
    async fn keeps_polling_when_idle_and_stops_on_signal() {
        let client = Arc::new(MockClient::logged_in());
        let (listener, captured) = listener(client.clone());

        let handle = listener.spawn();
        wait_until(|| MockClient::count(&client.get_msg_calls) >= 3).await;
        handle.shutdown().await;

        let text = captured.text();
        assert!(text.contains("消息监听已启动"));
        assert!(text.contains("消息监听已停止"));
    }
}
