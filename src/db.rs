//! 本地数据库读取
//!
//! 通过 SQLCipher 解密微信 4.x 的本地库，提供:
//! - 联系人查询 (contact/contact.db)
//! - 群成员昵称 (contact/contact.db chat_room.ext_buffer, protobuf)
//! - 增量消息获取 (message/message_0.db, 按表记录高水位线)
//!
//! 设计: rusqlite::Connection 是 !Send, 不能跨 .await 持有。
//! 策略: 所有 DB 操作在 spawn_blocking 中完成, 异步方法只操作缓存。

use anyhow::{Context, Result};
use prost::Message;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::logging::spawn_blocking_scoped;
use crate::message::CHATROOM_SUFFIX;

const CONTACT_DB: &str = "contact/contact.db";
const MESSAGE_DB: &str = "message/message_0.db";

/// zstd 帧头
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

// =====================================================================
// FFI: sqlite3_key (WCDB 密钥传递方式)
// =====================================================================

extern "C" {
    /// WCDB 使用 sqlite3_key() C API 传递 raw key (非 PRAGMA key).
    /// SQLCipher 会对这个 key 做 PBKDF2 派生.
    fn sqlite3_key(
        db: *mut std::ffi::c_void,
        key: *const u8,
        key_len: std::ffi::c_int,
    ) -> std::ffi::c_int;
}

// =====================================================================
// 类型定义
// =====================================================================

/// 联系人信息
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContactInfo {
    pub username: String,
    pub nick_name: String,
    pub remark: String,
    pub alias: String,
    /// 优先显示名: remark > nick_name > username
    pub display_name: String,
}

impl ContactInfo {
    pub fn new(username: String, nick_name: String, remark: String, alias: String) -> Self {
        let display_name = if !remark.is_empty() {
            remark.clone()
        } else if !nick_name.is_empty() {
            nick_name.clone()
        } else {
            username.clone()
        };
        Self { username, nick_name, remark, alias, display_name }
    }
}

/// 数据库消息
#[derive(Debug, Clone)]
pub struct DbMessage {
    /// local_type 低 32 位
    pub msg_type: u32,
    /// 发言人 wxid
    pub sender: String,
    /// 所属会话 (私聊为对方 wxid, 群聊为 xxx@chatroom)
    pub chat: String,
    /// 消息正文 (已解压, 已去掉群聊发言人前缀)
    pub content: String,
}

/// chat_room.ext_buffer
#[derive(Clone, PartialEq, Message)]
struct ChatRoomData {
    #[prost(message, repeated, tag = "1")]
    members: Vec<ChatRoomMember>,
}

#[derive(Clone, PartialEq, Message)]
struct ChatRoomMember {
    #[prost(string, tag = "1")]
    user_name: String,
    /// 群昵称, 未设置时为空
    #[prost(string, tag = "2")]
    display_name: String,
}

// =====================================================================
// DbManager — 核心结构
// =====================================================================

pub struct DbManager {
    /// 32 字节原始密钥
    key_bytes: Vec<u8>,
    /// 数据库存储目录 (如 ~/Documents/xwechat_files/<wxid>_xxxx/db_storage)
    db_dir: PathBuf,
    /// 联系人缓存: username → ContactInfo
    contacts: Mutex<HashMap<String, ContactInfo>>,
    /// 高水位线: 消息表名 → 最大 local_id
    watermarks: Mutex<HashMap<String, i64>>,
}

impl DbManager {
    pub fn new(key_hex: &str, db_dir: PathBuf) -> Result<Self> {
        let key_bytes = hex_to_bytes(key_hex.trim()).context("密钥 hex 格式错误")?;
        anyhow::ensure!(key_bytes.len() == 32, "密钥长度必须为 32 字节, 实际: {}", key_bytes.len());
        anyhow::ensure!(db_dir.is_dir(), "数据库目录不存在: {}", db_dir.display());

        info!("📦 DbManager 初始化: db_dir={}", db_dir.display());
        Ok(Self {
            key_bytes,
            db_dir,
            contacts: Mutex::new(HashMap::new()),
            watermarks: Mutex::new(HashMap::new()),
        })
    }

    // =================================================================
    // 数据库连接 (同步, 在 spawn_blocking 中调用)
    // =================================================================

    /// 打开加密数据库 (只读模式)
    fn open_db(key_bytes: &[u8], db_dir: &Path, db_name: &str) -> Result<Connection> {
        let path = db_dir.join(db_name);
        anyhow::ensure!(path.exists(), "数据库不存在: {}", path.display());

        let conn = Connection::open_with_flags(
            &path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        ).with_context(|| format!("打开数据库失败: {}", path.display()))?;

        apply_key(&conn, key_bytes)?;

        // 验证解密成功
        let count: i32 = conn.query_row(
            "SELECT count(*) FROM sqlite_master", [], |row| row.get(0),
        ).with_context(|| format!("数据库解密验证失败: {}", db_name))?;

        debug!("🔓 {} 解密成功, {} 个表", db_name, count);
        Ok(conn)
    }

    // =================================================================
    // 联系人
    // =================================================================

    /// 加载/刷新联系人缓存
    pub async fn refresh_contacts(&self) -> Result<usize> {
        let key = self.key_bytes.clone();
        let dir = self.db_dir.clone();

        let contacts = spawn_blocking_scoped(move || -> Result<Vec<ContactInfo>> {
            let conn = Self::open_db(&key, &dir, CONTACT_DB)?;
            let mut stmt = conn.prepare(
                "SELECT username, nick_name, remark, alias FROM contact"
            )?;
            let result: Vec<ContactInfo> = stmt.query_map([], |row| {
                Ok(ContactInfo::new(
                    row.get(0)?,
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                ))
            })?.filter_map(|r| r.ok()).collect();
            Ok(result)
        }).await??;

        let count = contacts.len();
        let mut cache = self.contacts.lock().await;
        cache.clear();
        for c in contacts {
            cache.insert(c.username.clone(), c);
        }
        info!("👥 联系人缓存: {} 条", count);
        Ok(count)
    }

    pub async fn get_contacts(&self) -> Vec<ContactInfo> {
        self.contacts.lock().await.values().cloned().collect()
    }

    pub async fn contact(&self, username: &str) -> Option<ContactInfo> {
        self.contacts.lock().await.get(username).cloned()
    }

    /// 通过 username 获取显示名 (未知时返回 username)
    pub async fn resolve_name(&self, username: &str) -> String {
        self.contacts.lock().await
            .get(username)
            .map(|c| c.display_name.clone())
            .unwrap_or_else(|| username.to_string())
    }

    /// 成员在群内设置的昵称; 没有群资料或未设置时返回 None
    pub async fn room_member_nickname(&self, room_id: &str, wxid: &str) -> Result<Option<String>> {
        let key = self.key_bytes.clone();
        let dir = self.db_dir.clone();
        let room_id = room_id.to_string();
        let wxid = wxid.to_string();

        spawn_blocking_scoped(move || -> Result<Option<String>> {
            let conn = Self::open_db(&key, &dir, CONTACT_DB)?;
            let Some(buf) = load_room_ext_buffer(&conn, &room_id)? else {
                return Ok(None);
            };
            let data = ChatRoomData::decode(buf.as_slice())
                .with_context(|| format!("解析群成员信息失败: {}", room_id))?;
            Ok(data.members.into_iter()
                .find(|m| m.user_name == wxid)
                .map(|m| m.display_name)
                .filter(|n| !n.is_empty()))
        }).await?
    }

    // =================================================================
    // 增量消息
    // =================================================================

    /// 获取高水位线之后的新消息, 按表内 local_id 升序
    pub async fn get_new_messages(&self) -> Result<Vec<DbMessage>> {
        let key = self.key_bytes.clone();
        let dir = self.db_dir.clone();
        let current = self.watermarks.lock().await.clone();

        let (msgs, new_watermarks) = spawn_blocking_scoped(move || -> Result<(Vec<DbMessage>, HashMap<String, i64>)> {
            let conn = Self::open_db(&key, &dir, MESSAGE_DB)?;
            let chats = chat_by_table(&conn)?;
            let senders = load_name2id(&conn)?;

            let mut all = Vec::new();
            let mut wm = current;
            for table in list_msg_tables(&conn)? {
                let Some(chat) = chats.get(&table) else {
                    debug!("⚠️ 无法解析会话名: {}", table);
                    continue;
                };
                let last_id = wm.get(&table).copied().unwrap_or(0);
                let rows = match query_table(&conn, &table, last_id) {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!("⚠️ 查询 {} 失败: {:#}", table, e);
                        continue;
                    }
                };
                if let Some(max_id) = rows.iter().map(|r| r.local_id).max() {
                    wm.insert(table.clone(), max_id);
                }
                debug!("📬 {} 查询到 {} 条消息 (高水位线={})", table, rows.len(), last_id);
                all.extend(rows.into_iter().map(|r| r.into_message(chat, &senders)));
            }
            Ok((all, wm))
        }).await??;

        *self.watermarks.lock().await = new_watermarks;
        if !msgs.is_empty() {
            info!("📨 获取 {} 条新消息", msgs.len());
        }
        Ok(msgs)
    }

    /// 标记所有已有消息为已读, 返回消息表数量
    pub async fn mark_all_read(&self) -> Result<usize> {
        let key = self.key_bytes.clone();
        let dir = self.db_dir.clone();

        let wm = spawn_blocking_scoped(move || -> Result<HashMap<String, i64>> {
            let conn = Self::open_db(&key, &dir, MESSAGE_DB)?;
            let mut watermarks = HashMap::new();
            for table in list_msg_tables(&conn)? {
                let sql = format!("SELECT MAX(local_id) FROM [{}]", table);
                if let Ok(Some(id)) = conn.query_row(&sql, [], |row| row.get::<_, Option<i64>>(0)) {
                    watermarks.insert(table, id);
                }
            }
            Ok(watermarks)
        }).await??;

        let count = wm.len();
        info!("✅ 已标记 {} 个消息表为已读", count);
        *self.watermarks.lock().await = wm;
        Ok(count)
    }
}

// =====================================================================
// 同步辅助函数
// =====================================================================

fn apply_key(conn: &Connection, key_bytes: &[u8]) -> Result<()> {
    // 通过 FFI 调用 sqlite3_key() 传递 raw key
    let rc = unsafe {
        let handle = conn.handle();
        sqlite3_key(
            handle as *mut std::ffi::c_void,
            key_bytes.as_ptr(),
            key_bytes.len() as std::ffi::c_int,
        )
    };
    anyhow::ensure!(rc == 0, "sqlite3_key() 失败, rc={}", rc);
    conn.execute_batch("PRAGMA cipher_compatibility = 4;")?;
    Ok(())
}

/// 会话 username 对应的消息表名: Msg_<md5(username)>
pub fn msg_table_name(username: &str) -> String {
    format!("Msg_{:x}", md5::compute(username.as_bytes()))
}

fn list_msg_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'Msg_%'"
    )?;
    let tables = stmt.query_map([], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok()).collect();
    Ok(tables)
}

/// Name2Id: rowid → user_name (real_sender_id 指向这里)
fn load_name2id(conn: &Connection) -> Result<HashMap<i64, String>> {
    let mut stmt = conn.prepare("SELECT rowid, user_name FROM Name2Id")?;
    let map = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .filter_map(|r| r.ok()).collect();
    Ok(map)
}

/// 消息表名 → 会话 username (对 Name2Id 中每个名字求 md5 反查)
fn chat_by_table(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT user_name FROM Name2Id")?;
    let map = stmt.query_map([], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .map(|name| (msg_table_name(&name), name))
        .collect();
    Ok(map)
}

/// 群资料 protobuf; 旧版库没有 chat_room 表
fn load_room_ext_buffer(conn: &Connection, room_id: &str) -> Result<Option<Vec<u8>>> {
    let has_table: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='chat_room'",
        [],
        |row| row.get(0),
    )?;
    if has_table == 0 {
        return Ok(None);
    }
    let buf = conn.query_row(
        "SELECT ext_buffer FROM chat_room WHERE username = ?1",
        [room_id],
        |row| row.get::<_, Option<Vec<u8>>>(0),
    ).optional()?;
    Ok(buf.flatten())
}

/// 原始行
struct RawRow {
    local_id: i64,
    local_type: i64,
    real_sender_id: i64,
    content: String,
}

impl RawRow {
    fn into_message(self, chat: &str, senders: &HashMap<i64, String>) -> DbMessage {
        let real_sender = senders.get(&self.real_sender_id).filter(|s| !s.is_empty());
        let (sender, content) = if chat.ends_with(CHATROOM_SUFFIX) {
            match split_sender_prefix(&self.content) {
                Some((prefix, body)) => (prefix.to_string(), body.to_string()),
                None => (real_sender.cloned().unwrap_or_else(|| chat.to_string()), self.content),
            }
        } else {
            (real_sender.cloned().unwrap_or_else(|| chat.to_string()), self.content)
        };
        DbMessage {
            msg_type: (self.local_type & 0xffff_ffff) as u32,
            sender,
            chat: chat.to_string(),
            content,
        }
    }
}

fn query_table(conn: &Connection, table: &str, last_id: i64) -> Result<Vec<RawRow>> {
    let sql = format!(
        "SELECT local_id, local_type, real_sender_id, message_content \
         FROM [{}] WHERE local_id > ?1 ORDER BY local_id ASC",
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([last_id], |row| {
        Ok(RawRow {
            local_id: row.get(0)?,
            local_type: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
            real_sender_id: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
            content: decode_content(row.get_ref(3)?),
        })
    })?.filter_map(|r| match r {
        Ok(v) => Some(v),
        Err(e) => { warn!("⚠️ 行解析失败: {}", e); None }
    }).collect();
    Ok(rows)
}

/// message_content 可能是 TEXT, 也可能是 zstd 压缩的 BLOB
fn decode_content(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Blob(bytes) if bytes.starts_with(&ZSTD_MAGIC) => match zstd::decode_all(bytes) {
            Ok(raw) => String::from_utf8_lossy(&raw).into_owned(),
            Err(e) => {
                warn!("⚠️ zstd 解压失败: {}", e);
                String::new()
            }
        },
        ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        _ => String::new(),
    }
}

/// 群聊正文 "wxid_xxx:\n正文" → ("wxid_xxx", "正文")
fn split_sender_prefix(content: &str) -> Option<(&str, &str)> {
    let (prefix, body) = content.split_once(":\n")?;
    let valid = !prefix.is_empty() && !prefix.chars().any(char::is_whitespace);
    valid.then_some((prefix, body))
}

fn hex_to_bytes(hex: &str) -> Result<Vec<u8>> {
    anyhow::ensure!(hex.len() % 2 == 0, "hex 长度必须为偶数");
    anyhow::ensure!(hex.is_ascii(), "hex 含非 ASCII 字符");
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .with_context(|| format!("无效 hex 字符: {}", &hex[i..i + 2]))
        })
        .collect()
}
