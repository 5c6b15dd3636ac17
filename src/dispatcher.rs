//! stdin 命令分发
//!
//! 每行一个 JSON 命令:
//! - `{"type":"send_message","data":{"recipient":..,"content":..,"at_users":..}}`
//! - `{"type":"get_status"}`
//! - `{"type":"exit"}`
//!
//! 响应写到 stdout 并立即 flush (父进程按行读取)。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

use crate::client::WxClient;

pub const MISSING_FIELDS_ERROR: &str = "recipient and content must not be empty";
pub const NOT_CONNECTED_ERROR: &str = "client not connected";
pub const STATUS_CONNECTED: &str = "状态: 已连接";
pub const STATUS_DISCONNECTED: &str = "状态: 未连接";

/// 分发循环结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// 收到 exit 命令
    Exit,
    /// stdin 已关闭
    EndOfInput,
}

/// 命令外层: type + 任意 data
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default)]
struct SendMessageData {
    recipient: Option<String>,
    content: Option<String>,
    at_users: Option<String>,
}

impl SendMessageData {
    /// 逐字段读取; 非字符串字段按缺失处理
    fn from_value(data: &Value) -> Self {
        let field = |name: &str| data.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            recipient: field("recipient"),
            content: field("content"),
            at_users: field("at_users"),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SendMessageResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub success: bool,
    pub error: Option<String>,
}

impl SendMessageResponse {
    fn new(result: Result<()>) -> Self {
        Self {
            kind: "send_message_response",
            success: result.is_ok(),
            error: result.err().map(|e| format!("{e:#}")),
        }
    }

    fn failure(msg: &str) -> Self {
        Self::new(Err(anyhow::anyhow!("{msg}")))
    }
}

pub struct Dispatcher<W> {
    client: Option<Arc<dyn WxClient>>,
    out: W,
}

impl<W: AsyncWrite + Unpin> Dispatcher<W> {
    pub fn new(client: Option<Arc<dyn WxClient>>, out: W) -> Self {
        Self { client, out }
    }

    /// 逐行读取并执行命令, 直到 exit 或输入结束
    ///
    /// 只有读取本身出错才结束循环; 非 UTF-8 的行记录后跳过。
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, mut input: R) -> Result<Shutdown> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = input.read_until(b'\n', &mut buf).await.context("读取 stdin 失败")?;
            if n == 0 {
                break;
            }
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    error!("解析命令失败: {e}");
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            if let Some(shutdown) = self.handle_line(line).await? {
                return Ok(shutdown);
            }
        }
        info!("标准输入已关闭");
        Ok(Shutdown::EndOfInput)
    }

    /// 执行一行命令; 返回 Some 表示应结束循环
    pub async fn handle_line(&mut self, line: &str) -> Result<Option<Shutdown>> {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(env) => env,
            Err(e) => {
                error!("解析命令失败: {e}");
                return Ok(None);
            }
        };

        match envelope.kind.as_str() {
            "send_message" => {
                let data = SendMessageData::from_value(&envelope.data);
                let response = self.send_message(data).await;
                let json = serde_json::to_string(&response)?;
                self.write_line(&json).await?;
            }
            "get_status" => {
                let status = self.status_line().await;
                self.write_line(status).await?;
            }
            "exit" => {
                if let Some(client) = &self.client {
                    if let Err(e) = client.cleanup().await {
                        warn!("清理失败: {e:#}");
                    }
                }
                info!("收到退出命令");
                return Ok(Some(Shutdown::Exit));
            }
            other => warn!("不支持的命令类型: {other}"),
        }
        Ok(None)
    }

    async fn send_message(&self, data: SendMessageData) -> SendMessageResponse {
        let recipient = data.recipient.filter(|s| !s.is_empty());
        let content = data.content.filter(|s| !s.is_empty());
        let (Some(recipient), Some(content)) = (recipient, content) else {
            return SendMessageResponse::failure(MISSING_FIELDS_ERROR);
        };
        let Some(client) = &self.client else {
            return SendMessageResponse::failure(NOT_CONNECTED_ERROR);
        };

        let at_users = data.at_users.as_deref().filter(|s| !s.is_empty());
        let result = client.send_message(&recipient, &content, at_users).await;
        if let Err(e) = &result {
            warn!("发送消息失败 [{recipient}]: {e:#}");
        }
        SendMessageResponse::new(result)
    }

    async fn status_line(&self) -> &'static str {
        let connected = match &self.client {
            Some(client) => client.is_login().await,
            None => false,
        };
        if connected { STATUS_CONNECTED } else { STATUS_DISCONNECTED }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.out.write_all(line.as_bytes()).await.context("写入 stdout 失败")?;
        self.out.write_all(b"\n").await.context("写入 stdout 失败")?;
        self.out.flush().await.context("flush stdout 失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockClient;
    use crate::logging::capture::Captured;
    use crate::logging::Logger;

    async fn run_with(client: Option<Arc<MockClient>>, input: &str) -> (Shutdown, String) {
        run_bytes(client, input.as_bytes()).await
    }

    async fn run_bytes(client: Option<Arc<MockClient>>, input: &[u8]) -> (Shutdown, String) {
        let client = client.map(|c| c as Arc<dyn WxClient>);
        let mut dispatcher = Dispatcher::new(client, Vec::new());
        let shutdown = dispatcher.run(input).await.unwrap();
        let out = String::from_utf8(dispatcher.out).unwrap();
        (shutdown, out)
    }

    fn response(line: &str) -> serde_json::Value {
        serde_json::from_str(line).unwrap()
    }

    #[tokio::test]
    async fn missing_fields_never_reach_client() {
        let client = Arc::new(MockClient::logged_in());
        let input = concat!(
            r#"{"type":"send_message","data":{"content":"hi"}}"#, "\n",
            r#"{"type":"send_message","data":{"recipient":"wxid_a"}}"#, "\n",
            r#"{"type":"send_message","data":{"recipient":"","content":"hi"}}"#, "\n",
            r#"{"type":"send_message"}"#, "\n",
            r#"{"type":"send_message","data":{"recipient":5,"content":"hi"}}"#, "\n",
        );
        let (shutdown, out) = run_with(Some(client.clone()), input).await;

        assert_eq!(shutdown, Shutdown::EndOfInput);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 5);
        for line in lines {
            let v = response(line);
            assert_eq!(v["type"], "send_message_response");
            assert_eq!(v["success"], false);
            assert_eq!(v["error"], MISSING_FIELDS_ERROR);
        }
        assert!(client.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_message_calls_client_once() {
        let client = Arc::new(MockClient::logged_in());
        let input = r#"{"type":"send_message","data":{"recipient":"wxid_a","content":"你好","at_users":"wxid_b,wxid_c"}}"#;
        let (_, out) = run_with(Some(client.clone()), input).await;

        let v = response(out.trim_end());
        assert_eq!(v["success"], true);
        assert!(v["error"].is_null());
        let sent = client.sent.lock().unwrap();
        assert_eq!(
            *sent,
            [("wxid_a".to_string(), "你好".to_string(), Some("wxid_b,wxid_c".to_string()))]
        );
    }

    #[tokio::test]
    async fn send_failure_is_reflected() {
        let client = Arc::new(MockClient { send_error: Some("window not found".into()), ..MockClient::logged_in() });
        let input = r#"{"type":"send_message","data":{"recipient":"wxid_a","content":"x"}}"#;
        let (_, out) = run_with(Some(client.clone()), input).await;

        let v = response(out.trim_end());
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "window not found");
        assert_eq!(client.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_without_client_fails() {
        let input = r#"{"type":"send_message","data":{"recipient":"wxid_a","content":"x"}}"#;
        let (_, out) = run_with(None, input).await;
        assert_eq!(response(out.trim_end())["error"], NOT_CONNECTED_ERROR);
    }

    #[tokio::test]
    async fn status_reflects_login() {
        let (_, out) = run_with(Some(Arc::new(MockClient::logged_in())), r#"{"type":"get_status"}"#).await;
        assert_eq!(out, "状态: 已连接\n");

        let (_, out) = run_with(Some(Arc::new(MockClient::default())), r#"{"type":"get_status"}"#).await;
        assert_eq!(out, "状态: 未连接\n");

        let (_, out) = run_with(None, r#"{"type":"get_status"}"#).await;
        assert_eq!(out, "状态: 未连接\n");
    }

    #[tokio::test]
    async fn exit_cleans_up_once_and_stops_reading() {
        let client = Arc::new(MockClient::logged_in());
        let input = concat!(r#"{"type":"exit"}"#, "\n", r#"{"type":"get_status"}"#, "\n");
        let (shutdown, out) = run_with(Some(client.clone()), input).await;

        assert_eq!(shutdown, Shutdown::Exit);
        assert_eq!(MockClient::count(&client.cleanup_calls), 1);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn exit_without_client_still_exits() {
        let (shutdown, out) = run_with(None, r#"{"type":"exit"}"#).await;
        assert_eq!(shutdown, Shutdown::Exit);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn malformed_line_is_logged_and_skipped() {
        let captured = Captured::default();
        let logger = Logger::with_writer("info", captured.clone());
        let input = concat!("{not json\n", "\n", r#"{"type":"get_status"}"#, "\n");

        let (shutdown, out) = logger
            .scope(run_with(Some(Arc::new(MockClient::logged_in())), input))
            .await;

        assert_eq!(shutdown, Shutdown::EndOfInput);
        assert_eq!(out, "状态: 已连接\n");
        assert!(captured.text().contains("解析命令失败"));
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped() {
        let captured = Captured::default();
        let logger = Logger::with_writer("info", captured.clone());
        let input = b"\xff\xfe garbage\n{\"type\":\"get_status\"}\n";

        let (shutdown, out) = logger
            .scope(run_bytes(Some(Arc::new(MockClient::logged_in())), input))
            .await;

        assert_eq!(shutdown, Shutdown::EndOfInput);
        assert_eq!(out, "状态: 已连接\n");
        assert!(captured.text().contains("解析命令失败"));
    }

    #[tokio::test]
    async fn wrong_typed_at_users_is_treated_as_absent() {
        let client = Arc::new(MockClient::logged_in());
        let input = r#"{"type":"send_message","data":{"recipient":"wxid_a","content":"hi","at_users":["wxid_b"]}}"#;
        let (_, out) = run_with(Some(client.clone()), input).await;

        let v = response(out.trim_end());
        assert_eq!(v["success"], true);
        assert_eq!(*client.sent.lock().unwrap(), [("wxid_a".to_string(), "hi".to_string(), None)]);
    }

    #[tokio::test]
    async fn unknown_command_is_ignored() {
        let captured = Captured::default();
        let logger = Logger::with_writer("info", captured.clone());
        let input = concat!(r#"{"type":"reboot","data":{}}"#, "\n", r#"{"type":"get_status"}"#, "\n");

        let (_, out) = logger
            .scope(run_with(Some(Arc::new(MockClient::logged_in())), input))
            .await;

        assert_eq!(out, "状态: 已连接\n");
        assert!(captured.text().contains("不支持的命令类型: reboot"));
    }

    #[tokio::test]
    async fn end_of_input_returns_cleanly() {
        let (shutdown, out) = run_with(None, "").await;
        assert_eq!(shutdown, Shutdown::EndOfInput);
        assert!(out.is_empty());
    }
}
