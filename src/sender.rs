//! 窗口驱动发送
//!
//! 通过 xdotool 激活微信主窗口, 用 Ctrl+F 搜索会话, 中文/emoji 走
//! xclip 剪贴板 + Ctrl+V, 最后 Enter 发送。
//!
//! 发送流程先生成步骤列表 (plan), 再逐步执行, 便于单独验证。

use anyhow::{bail, Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// 单个界面操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// 激活主窗口
    Activate,
    /// 组合键 (xdotool key 语法)
    Key(&'static str),
    /// 写剪贴板并粘贴
    Paste(String),
    Pause(Duration),
}

/// 发送一条消息的操作序列
pub fn plan(search_name: &str, text: &str) -> Vec<Step> {
    vec![
        Step::Activate,
        Step::Pause(ms(300)),
        Step::Key("ctrl+f"),
        Step::Pause(ms(300)),
        Step::Paste(search_name.to_string()),
        Step::Pause(ms(800)),
        Step::Key("Return"),
        Step::Pause(ms(500)),
        Step::Paste(text.to_string()),
        Step::Pause(ms(300)),
        Step::Key("Return"),
        Step::Pause(ms(500)),
    ]
}

pub struct WindowSender {
    /// 主窗口标题 (精确匹配)
    window_titles: Vec<String>,
    /// 同一时刻只执行一个发送流程
    busy: Mutex<()>,
}

impl WindowSender {
    pub fn new(window_titles: Vec<String>) -> Self {
        Self { window_titles, busy: Mutex::new(()) }
    }

    /// 在 `search_name` 会话中发送 `text`
    pub async fn send_text(&self, search_name: &str, text: &str) -> Result<()> {
        let _guard = self.busy.lock().await;
        let wid = self.find_main_window().await?;
        info!("📤 发送: [{search_name}] → {} 字", text.chars().count());

        for step in plan(search_name, text) {
            debug!("[send] {:?}", step);
            match step {
                Step::Activate => {
                    xdotool(&["windowactivate", "--sync", &wid]).await?;
                }
                Step::Key(combo) => {
                    xdotool(&["key", "--clearmodifiers", combo]).await?;
                }
                Step::Paste(content) => {
                    set_clipboard(&content).await?;
                    xdotool(&["key", "--clearmodifiers", "ctrl+v"]).await?;
                }
                Step::Pause(d) => tokio::time::sleep(d).await,
            }
        }
        Ok(())
    }

    /// xdotool 按窗口名精确查找主窗口
    pub async fn find_main_window(&self) -> Result<String> {
        for title in &self.window_titles {
            let output = Command::new("xdotool")
                .args(["search", "--name", &format!("^{}$", title)])
                .stderr(Stdio::null())
                .output()
                .await
                .context("xdotool 未安装")?;
            let wids = String::from_utf8_lossy(&output.stdout);
            if let Some(wid) = wids.lines().map(str::trim).find(|s| !s.is_empty()) {
                debug!("🖱️ 主窗口: {title} (wid={wid})");
                return Ok(wid.to_string());
            }
        }
        bail!("未找到微信主窗口 (标题: {:?})", self.window_titles)
    }
}

async fn xdotool(args: &[&str]) -> Result<()> {
    let status = Command::new("xdotool")
        .args(args)
        .stderr(Stdio::null())
        .status()
        .await
        .context("xdotool 未安装")?;
    anyhow::ensure!(status.success(), "xdotool {} 失败: {}", args.join(" "), status);
    Ok(())
}

/// 通过 xclip 写入剪贴板 (支持中文)
async fn set_clipboard(text: &str) -> Result<()> {
    let mut child = Command::new("xclip")
        .args(["-selection", "clipboard"])
        .stdin(Stdio::piped())
        .spawn()
        .context("xclip 未安装")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(text.as_bytes()).await?;
    }
    let status = child.wait().await?;
    anyhow::ensure!(status.success(), "xclip 写入剪贴板失败: {}", status);
    Ok(())
}
