//! 微信客户端句柄
//!
//! WxClient 是监听任务和命令分发器唯一依赖的接口;
//! LocalClient 是它在本机上的实现: 读库 (db) 收消息/查联系人, 驱动窗口 (sender) 发消息。

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::WeChatConfig;
use crate::db::{ContactInfo, DbManager, DbMessage};
use crate::message::{InboundMessage, CHATROOM_SUFFIX};
use crate::sender::WindowSender;

/// 非好友的内置账号
const SYSTEM_ACCOUNTS: &[&str] = &[
    "fmessage", "floatbottle", "filehelper", "medianote", "newsapp", "weixin",
    "qqmail", "qmessage", "tmessage", "qqsync", "lbsapp", "shakeapp",
    "voipapp", "qqfriend", "blogapp", "masssendapp", "feedsapp", "weibo",
    "mphelper", "notifymessage",
];

/// 当前账号信息
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UserInfo {
    pub wxid: String,
    pub name: String,
    pub remark: String,
}

// =====================================================================
// 接口
// =====================================================================

#[async_trait]
pub trait WxClient: Send + Sync {
    /// 是否已登录
    async fn is_login(&self) -> bool;

    async fn is_receiving_msg(&self) -> bool;

    /// 开启消息接收 (此前的消息视为已读)
    async fn enable_receiving_msg(&self) -> Result<()>;

    /// 取下一条消息; 暂无消息时返回 Ok(None)
    async fn get_msg(&self) -> Result<Option<InboundMessage>>;

    async fn get_self_wxid(&self) -> Result<String>;

    async fn get_user_info(&self) -> Result<UserInfo>;

    async fn get_friends(&self) -> Result<Vec<ContactInfo>>;

    /// 群名称
    async fn get_room_name(&self, room_id: &str) -> Result<String>;

    /// 群成员在群内的昵称
    async fn get_room_member_nickname(&self, wxid: &str, room_id: &str) -> Result<String>;

    /// 发送文本; `at_users` 为逗号分隔的 wxid
    async fn send_message(&self, recipient: &str, content: &str, at_users: Option<&str>) -> Result<()>;

    /// 退出前清理
    async fn cleanup(&self) -> Result<()>;
}

/// 好友判定: 排除群、公众号、企业微信和内置账号
pub fn is_friend(username: &str) -> bool {
    !username.is_empty()
        && !username.ends_with(CHATROOM_SUFFIX)
        && !username.starts_with("gh_")
        && !username.contains("@openim")
        && !SYSTEM_ACCOUNTS.contains(&username)
}

/// 从 db_storage 路径推断 wxid: .../xwechat_files/<wxid>_<4位后缀>/db_storage
pub fn wxid_from_db_dir(db_dir: &Path) -> Option<String> {
    let account_dir = db_dir.parent()?.file_name()?.to_str()?;
    let wxid = match account_dir.rsplit_once('_') {
        Some((head, tail)) if head.starts_with("wxid_") && tail.len() == 4 => head,
        _ => account_dir,
    };
    (!wxid.is_empty()).then(|| wxid.to_string())
}

/// 窗口搜索关键字: 显示名唯一时用显示名, 否则用微信号, 没有微信号再用 wxid
pub fn search_key(username: &str, contacts: &[ContactInfo]) -> String {
    let Some(target) = contacts.iter().find(|c| c.username == username) else {
        return username.to_string();
    };
    let name = target.display_name.as_str();
    let ambiguous = contacts.iter().any(|c| {
        c.username != target.username
            && (c.display_name == name || c.nick_name == name || c.remark == name)
    });
    if !ambiguous {
        name.to_string()
    } else if !target.alias.is_empty() {
        target.alias.clone()
    } else {
        target.username.clone()
    }
}

/// 在正文前补上未出现的 @昵称
pub fn with_mentions(content: &str, names: &[String]) -> String {
    let prefix: String = names
        .iter()
        .filter(|n| !content.contains(&format!("@{n}")))
        .map(|n| format!("@{n} "))
        .collect();
    format!("{prefix}{content}")
}

// =====================================================================
// LocalClient — 本机实现
// =====================================================================

pub struct LocalClient {
    db: DbManager,
    sender: WindowSender,
    wxid: String,
    receiving: AtomicBool,
    /// 已从库中取出、尚未交给调用方的消息
    queue: Mutex<VecDeque<InboundMessage>>,
}

impl LocalClient {
    pub fn open(config: &WeChatConfig) -> Result<Self> {
        let db_dir = config.db_dir.clone()
            .context("未配置微信数据库目录 (wechat.db_dir / NEW_BOY_DB_DIR)")?;
        let key = config.db_key.as_deref()
            .context("未配置数据库密钥 (wechat.db_key / NEW_BOY_DB_KEY)")?;
        let wxid = match &config.wxid {
            Some(w) => w.clone(),
            None => wxid_from_db_dir(&db_dir)
                .with_context(|| format!("无法从路径推断 wxid: {}", db_dir.display()))?,
        };

        let db = DbManager::new(key, db_dir)?;
        Ok(Self {
            db,
            sender: WindowSender::new(config.window_titles.clone()),
            wxid,
            receiving: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    fn into_inbound(m: DbMessage) -> InboundMessage {
        InboundMessage::new(m.sender, Some(m.chat), m.msg_type, m.content)
    }
}

#[async_trait]
impl WxClient for LocalClient {
    /// 库能解密且联系人加载成功即视为已登录
    async fn is_login(&self) -> bool {
        match self.db.refresh_contacts().await {
            Ok(_) => true,
            Err(e) => {
                debug!("登录检查失败: {e:#}");
                false
            }
        }
    }

    async fn is_receiving_msg(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    async fn enable_receiving_msg(&self) -> Result<()> {
        self.db.mark_all_read().await?;
        self.queue.lock().await.clear();
        self.receiving.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_msg(&self) -> Result<Option<InboundMessage>> {
        if !self.receiving.load(Ordering::SeqCst) {
            bail!("消息接收未启用");
        }
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            let fresh = self.db.get_new_messages().await?;
            queue.extend(fresh.into_iter().map(Self::into_inbound));
        }
        Ok(queue.pop_front())
    }

    async fn get_self_wxid(&self) -> Result<String> {
        Ok(self.wxid.clone())
    }

    async fn get_user_info(&self) -> Result<UserInfo> {
        let contact = self.db.contact(&self.wxid).await;
        Ok(UserInfo {
            wxid: self.wxid.clone(),
            name: contact.as_ref().map(|c| c.nick_name.clone()).unwrap_or_default(),
            remark: contact.map(|c| c.remark).unwrap_or_default(),
        })
    }

    async fn get_friends(&self) -> Result<Vec<ContactInfo>> {
        let mut friends: Vec<ContactInfo> = self.db.get_contacts().await
            .into_iter()
            .filter(|c| is_friend(&c.username) && c.username != self.wxid)
            .collect();
        friends.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(friends)
    }

    async fn get_room_name(&self, room_id: &str) -> Result<String> {
        Ok(self.db.resolve_name(room_id).await)
    }

    /// 群昵称优先, 否则取联系人显示名
    async fn get_room_member_nickname(&self, wxid: &str, room_id: &str) -> Result<String> {
        let nickname = match self.db.room_member_nickname(room_id, wxid).await {
            Ok(n) => n,
            Err(e) => {
                warn!("读取群昵称失败 [{room_id}]: {e:#}");
                None
            }
        };
        match nickname {
            Some(n) => Ok(n),
            None => Ok(self.db.resolve_name(wxid).await),
        }
    }

    async fn send_message(&self, recipient: &str, content: &str, at_users: Option<&str>) -> Result<()> {
        let search_name = search_key(recipient, &self.db.get_contacts().await);
        let mut names = Vec::new();
        for wxid in at_users.unwrap_or_default().split(',').map(str::trim).filter(|s| !s.is_empty()) {
            names.push(self.db.resolve_name(wxid).await);
        }
        let text = with_mentions(content, &names);
        self.sender.send_text(&search_name, &text).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.receiving.store(false, Ordering::SeqCst);
        self.queue.lock().await.clear();
        info!("🧹 已停止消息接收");
        Ok(())
    }
}

// =====================================================================
// 测试替身
// =====================================================================
