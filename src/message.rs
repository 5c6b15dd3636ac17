//! 消息模型
//!
//! - InboundMessage: 收到的单条消息 (仅在一次日志记录期间存在)
//! - ChatKind: 私聊 / 群聊 分类 (构造时确定一次)
//! - MsgType: 消息类型码 → 中文描述
//! - app_message_title: 应用消息 (type 49) XML 标题提取

use chrono::{DateTime, Local};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

/// 群聊 ID 后缀
pub const CHATROOM_SUFFIX: &str = "@chatroom";

// =====================================================================
// 消息类型
// =====================================================================

/// 消息类型 (封闭映射表, 其余一律 Unknown)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Text,
    Image,
    Voice,
    Video,
    Emoji,
    App,
    System,
    Unknown(u32),
}

impl From<u32> for MsgType {
    fn from(code: u32) -> Self {
        match code {
            1 => Self::Text,
            3 => Self::Image,
            34 => Self::Voice,
            43 => Self::Video,
            47 => Self::Emoji,
            49 => Self::App,
            10000 => Self::System,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "文本消息"),
            Self::Image => write!(f, "图片消息"),
            Self::Voice => write!(f, "语音消息"),
            Self::Video => write!(f, "视频消息"),
            Self::Emoji => write!(f, "表情消息"),
            Self::App => write!(f, "应用消息"),
            Self::System => write!(f, "系统消息"),
            Self::Unknown(code) => write!(f, "未知类型({code})"),
        }
    }
}

/// 类型码 → 可读描述
pub fn msg_type_label(code: u32) -> String {
    MsgType::from(code).to_string()
}

// =====================================================================
// 入站消息
// =====================================================================

/// 会话分类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatKind {
    /// 私聊
    Direct,
    /// 群聊
    Group { room_id: String },
}

/// 收到的消息
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// 发送者 wxid
    pub sender: String,
    pub chat: ChatKind,
    /// 类型码 (低 32 位)
    pub msg_type: u32,
    pub content: String,
    /// 接收时间 (本地时区)
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    /// 构造消息并确定会话分类
    ///
    /// `room_id` 以 `@chatroom` 结尾时为群聊; 为空、缺失或个人 ID 时为私聊。
    pub fn new(
        sender: impl Into<String>,
        room_id: Option<String>,
        msg_type: u32,
        content: impl Into<String>,
    ) -> Self {
        let chat = match room_id {
            Some(id) if id.ends_with(CHATROOM_SUFFIX) => ChatKind::Group { room_id: id },
            _ => ChatKind::Direct,
        };
        Self {
            sender: sender.into(),
            chat,
            msg_type,
            content: content.into(),
            received_at: Local::now(),
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match &self.chat {
            ChatKind::Group { room_id } => Some(room_id),
            ChatKind::Direct => None,
        }
    }

    pub fn kind(&self) -> MsgType {
        MsgType::from(self.msg_type)
    }
}

// =====================================================================
// 应用消息
// =====================================================================

/// 提取应用消息 XML 中 `<appmsg>` 下的第一个 `<title>`
///
/// 非 XML 或无标题时返回 None。
pub fn app_message_title(content: &str) -> Option<String> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut in_appmsg = false;
    let mut in_title = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"appmsg" => in_appmsg = true,
                b"title" if in_appmsg => in_title = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"appmsg" => in_appmsg = false,
                b"title" => in_title = false,
                _ => {}
            },
            Ok(Event::Text(t)) if in_title => {
                let title = t.unescape().ok()?.trim().to_string();
                return (!title.is_empty()).then_some(title);
            }
            Ok(Event::CData(t)) if in_title => {
                let title = String::from_utf8_lossy(&t.into_inner()).trim().to_string();
                return (!title.is_empty()).then_some(title);
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}
