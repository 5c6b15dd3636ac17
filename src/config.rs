//! 配置
//!
//! 读取 `<app-data>/new-boy/config.toml` (可用 NEW_BOY_CONFIG 覆盖路径),
//! 文件不存在时全部取默认值; 数据库相关字段可由环境变量覆盖。

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 应用目录名 (位于用户数据目录下)
pub const APP_NAME: &str = "new-boy";

const ENV_CONFIG: &str = "NEW_BOY_CONFIG";
const ENV_DB_DIR: &str = "NEW_BOY_DB_DIR";
const ENV_DB_KEY: &str = "NEW_BOY_DB_KEY";
const ENV_WXID: &str = "NEW_BOY_WXID";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub wechat: WeChatConfig,
    pub listener: ListenerConfig,
    pub log: LogConfig,
    /// 应用数据目录 (不从文件读取)
    #[serde(skip)]
    pub app_dir: PathBuf,
}

/// 本地微信客户端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeChatConfig {
    /// db_storage 目录
    pub db_dir: Option<PathBuf>,
    /// 32 字节数据库密钥 (hex)
    pub db_key: Option<String>,
    /// 当前账号 wxid, 缺省时从 db_dir 推断
    pub wxid: Option<String>,
    /// 主窗口标题 (xdotool 精确匹配)
    pub window_titles: Vec<String>,
}

impl Default for WeChatConfig {
    fn default() -> Self {
        Self {
            db_dir: None,
            db_key: None,
            wxid: None,
            window_titles: vec!["微信".into(), "WeChat".into(), "Weixin".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 500, error_backoff_ms: 1000 }
    }
}

impl ListenerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// EnvFilter 指令, 优先于 RUST_LOG
    pub filter: Option<String>,
    /// 日志文件使用 JSON 格式
    pub json: bool,
}

impl Config {
    /// 加载配置 (文件 + 环境变量)
    pub fn load() -> Result<Self> {
        let app_dir = app_dir()?;
        let path = std::env::var_os(ENV_CONFIG)
            .map(PathBuf::from)
            .unwrap_or_else(|| app_dir.join("config.toml"));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.app_dir = app_dir;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置失败: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("解析配置失败: {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// 环境变量覆盖 (lookup 便于测试注入)
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_DB_DIR).filter(|v| !v.is_empty()) {
            self.wechat.db_dir = Some(PathBuf::from(dir));
        }
        if let Some(key) = lookup(ENV_DB_KEY).filter(|v| !v.is_empty()) {
            self.wechat.db_key = Some(key);
        }
        if let Some(wxid) = lookup(ENV_WXID).filter(|v| !v.is_empty()) {
            self.wechat.wxid = Some(wxid);
        }
    }

    /// `<app-data>/new-boy/logs/robot.log`
    pub fn log_file(&self) -> PathBuf {
        self.app_dir.join("logs").join("robot.log")
    }
}

/// 用户数据目录下的应用目录 (Windows: %APPDATA%\new-boy)
pub fn app_dir() -> Result<PathBuf> {
    let base = directories::BaseDirs::new().context("无法确定用户数据目录")?;
    Ok(base.data_dir().join(APP_NAME))
}
