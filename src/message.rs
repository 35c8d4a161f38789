//! Message protocol definitions
//!
//! Plain-text, line-based protocol. Inbound lines parse into
//! `ClientCommand`; outbound `ServerMessage`s render through `Display`
//! (the line terminator is added by the codec).

use std::fmt;
use std::net::SocketAddr;

use crate::error::AppError;

/// Notice broadcast when a user comes online
pub const JOINED: &str = "已上线";
/// Notice broadcast when a user goes offline
pub const LEFT: &str = "已下线";

const RENAME_PREFIX: &str = "rename ";
const WHISPER_PREFIX: &str = "msg ";

/// Client → Server command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `list`: enumerate online users
    List,
    /// `rename <name>`
    Rename { name: String },
    /// `msg <target> <content>`
    Whisper { target: String, content: String },
    /// Any other line: public broadcast
    Say { text: String },
}

impl ClientCommand {
    /// Parse one inbound line (terminator already stripped)
    ///
    /// Commands are case-sensitive. For `msg`, the line is split on single
    /// spaces and only the third token is kept as content, so
    /// `msg bob hello there` sends `hello`.
    pub fn parse(line: &str) -> Result<Self, AppError> {
        if line == "list" {
            return Ok(ClientCommand::List);
        }

        if let Some(name) = line.strip_prefix(RENAME_PREFIX) {
            if name.is_empty() {
                return Err(AppError::EmptyName);
            }
            return Ok(ClientCommand::Rename {
                name: name.to_string(),
            });
        }

        if line.starts_with(WHISPER_PREFIX) {
            let tokens: Vec<&str> = line.split(' ').collect();
            if tokens.len() < 3 {
                return Err(AppError::MalformedWhisper);
            }
            if tokens[1].is_empty() {
                return Err(AppError::EmptyTarget);
            }
            if tokens[2].is_empty() {
                return Err(AppError::EmptyContent);
            }
            return Ok(ClientCommand::Whisper {
                target: tokens[1].to_string(),
                content: tokens[2].to_string(),
            });
        }

        Ok(ClientCommand::Say {
            text: line.to_string(),
        })
    }
}

/// Server → Client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Public line: chat, join or leave notice
    Public {
        addr: SocketAddr,
        name: String,
        text: String,
    },
    /// One `list` entry
    Presence { addr: SocketAddr, name: String },
    /// Rename succeeded
    Renamed { name: String },
    /// Confirmation to the sender of a private message
    WhisperSent { to: String, content: String },
    /// Private message delivered to its target
    WhisperReceived { from: String, content: String },
    /// Idle timeout eviction notice
    TimedOut,
    /// Error reply
    Error { message: String },
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Public { addr, name, text } => write!(f, "[{}]{}: {}", addr, name, text),
            ServerMessage::Presence { addr, name } => write!(f, "[{}]{}: 在线...", addr, name),
            ServerMessage::Renamed { name } => write!(f, "您已经更新用户名: {}", name),
            ServerMessage::WhisperSent { to, content } => write!(f, "你对{}说：{}", to, content),
            ServerMessage::WhisperReceived { from, content } => {
                write!(f, "{}对你说：{}", from, content)
            }
            ServerMessage::TimedOut => f.write_str("你已超时，已被踢出"),
            ServerMessage::Error { message } => f.write_str(message),
        }
    }
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let message = match &err {
            AppError::EmptyName => "用户名不能为空".to_string(),
            AppError::NameInUse(_) => "当前用户名已被使用".to_string(),
            AppError::MalformedWhisper => {
                "消息格式不正确，请使用 \"msg 张三 你好啊\" 格式".to_string()
            }
            AppError::EmptyTarget => {
                "私聊对象不能为空，请使用 \"msg 张三 你好啊\" 格式".to_string()
            }
            AppError::EmptyContent => "消息内容不能为空，请重发".to_string(),
            AppError::UserNotFound(_) => "该用户名不存在".to_string(),
            // Fatal errors are not typically converted (connection closes)
            _ => "服务器内部错误".to_string(),
        };
        ServerMessage::Error { message }
    }
}
