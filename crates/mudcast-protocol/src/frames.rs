//! Frame types for the mudcast protocol.
//!
//! A session opens with `Login`, after which the client issues channel and
//! watch commands and the server pushes channel lines and notices back.

use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Login = 0x01,
    Join = 0x02,
    Leave = 0x03,
    Mute = 0x04,
    Unmute = 0x05,
    Say = 0x06,
    History = 0x07,
    Watch = 0x08,
    Unwatch = 0x09,
    WatchAll = 0x0A,
    WatchActive = 0x0B,
    Hide = 0x0C,
    Permit = 0x0D,
    Unpermit = 0x0E,
    Ping = 0x0F,
    Welcome = 0x81,
    Ack = 0x82,
    Error = 0x83,
    ChannelLine = 0x84,
    Notice = 0x85,
    HistoryLines = 0x86,
    Pong = 0x87,
}

impl FrameType {
    /// Whether a client may send this frame.
    #[must_use]
    pub fn is_client(self) -> bool {
        (self as u8) < 0x80
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Login),
            0x02 => Ok(FrameType::Join),
            0x03 => Ok(FrameType::Leave),
            0x04 => Ok(FrameType::Mute),
            0x05 => Ok(FrameType::Unmute),
            0x06 => Ok(FrameType::Say),
            0x07 => Ok(FrameType::History),
            0x08 => Ok(FrameType::Watch),
            0x09 => Ok(FrameType::Unwatch),
            0x0A => Ok(FrameType::WatchAll),
            0x0B => Ok(FrameType::WatchActive),
            0x0C => Ok(FrameType::Hide),
            0x0D => Ok(FrameType::Permit),
            0x0E => Ok(FrameType::Unpermit),
            0x0F => Ok(FrameType::Ping),
            0x81 => Ok(FrameType::Welcome),
            0x82 => Ok(FrameType::Ack),
            0x83 => Ok(FrameType::Error),
            0x84 => Ok(FrameType::ChannelLine),
            0x85 => Ok(FrameType::Notice),
            0x86 => Ok(FrameType::HistoryLines),
            0x87 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// First frame was not `Login`, or `Login` was sent twice.
    pub const NOT_LOGGED_IN: u16 = 1000;
    /// The requested name is already connected.
    pub const NAME_IN_USE: u16 = 1001;
    /// Unknown channel name or alias.
    pub const CHANNEL_NOT_FOUND: u16 = 1002;
    /// A lock denied the requested capability.
    pub const PERMISSION_DENIED: u16 = 1003;
    /// Subscription or mute state did not allow the request.
    pub const BAD_STATE: u16 = 1004;
    /// Message or name failed validation.
    pub const INVALID: u16 = 1005;
    /// The server refused a new session.
    pub const SERVER_FULL: u16 = 1006;
    /// Attribute storage failed.
    pub const STORAGE: u16 = 1007;
    /// Client protocol major version does not match.
    pub const VERSION_MISMATCH: u16 = 1008;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Claim a player name. Must be the first frame of a session.
    #[serde(rename = "login")]
    Login {
        /// Player name.
        name: String,
        /// Client protocol version.
        #[serde(default)]
        version: Version,
    },

    /// Subscribe to a channel.
    #[serde(rename = "join")]
    Join {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel key or alias.
        channel: String,
    },

    /// Unsubscribe from a channel.
    #[serde(rename = "leave")]
    Leave { id: u64, channel: String },

    /// Stop receiving a channel without leaving it.
    #[serde(rename = "mute")]
    Mute { id: u64, channel: String },

    /// Resume receiving a muted channel.
    #[serde(rename = "unmute")]
    Unmute { id: u64, channel: String },

    /// Speak on a channel.
    #[serde(rename = "say")]
    Say {
        /// Optional request ID for acknowledgment.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Channel key or alias.
        channel: String,
        /// Message text.
        text: String,
    },

    /// Ask for recent lines on a channel.
    #[serde(rename = "history")]
    History {
        id: u64,
        channel: String,
        /// Maximum number of lines, server default if absent.
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    /// Add a player to the watch list.
    #[serde(rename = "watch")]
    Watch { id: u64, name: String },

    /// Remove a player from the watch list.
    #[serde(rename = "unwatch")]
    Unwatch { id: u64, name: String },

    /// Toggle watching everyone.
    #[serde(rename = "watch_all")]
    WatchAll { id: u64, enabled: bool },

    /// Toggle receiving watch notices at all.
    #[serde(rename = "watch_active")]
    WatchActive { id: u64, enabled: bool },

    /// Toggle hiding from watchers.
    #[serde(rename = "hide")]
    Hide { id: u64, hidden: bool },

    /// Allow a player to see us while hidden.
    #[serde(rename = "permit")]
    Permit { id: u64, name: String },

    /// Revoke a hidden-watch permit.
    #[serde(rename = "unpermit")]
    Unpermit { id: u64, name: String },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Login accepted.
    #[serde(rename = "welcome")]
    Welcome {
        /// Name the session is known by.
        name: String,
        /// Server protocol version.
        version: Version,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
        /// Channels the player was auto-joined to.
        channels: Vec<String>,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack { id: u64 },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// A rendered channel line.
    #[serde(rename = "channel_line")]
    ChannelLine {
        /// Channel key.
        channel: String,
        /// Rendered text including the channel prefix.
        text: String,
    },

    /// Free-form server text, such as a watch notice.
    #[serde(rename = "notice")]
    Notice { text: String },

    /// Reply to `History`, oldest first.
    #[serde(rename = "history_lines")]
    HistoryLines {
        id: u64,
        channel: String,
        lines: Vec<String>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Login { .. } => FrameType::Login,
            Frame::Join { .. } => FrameType::Join,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Mute { .. } => FrameType::Mute,
            Frame::Unmute { .. } => FrameType::Unmute,
            Frame::Say { .. } => FrameType::Say,
            Frame::History { .. } => FrameType::History,
            Frame::Watch { .. } => FrameType::Watch,
            Frame::Unwatch { .. } => FrameType::Unwatch,
            Frame::WatchAll { .. } => FrameType::WatchAll,
            Frame::WatchActive { .. } => FrameType::WatchActive,
            Frame::Hide { .. } => FrameType::Hide,
            Frame::Permit { .. } => FrameType::Permit,
            Frame::Unpermit { .. } => FrameType::Unpermit,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Welcome { .. } => FrameType::Welcome,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::ChannelLine { .. } => FrameType::ChannelLine,
            Frame::Notice { .. } => FrameType::Notice,
            Frame::HistoryLines { .. } => FrameType::HistoryLines,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Request ID the server should answer, if the frame carries one.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Join { id, .. }
            | Frame::Leave { id, .. }
            | Frame::Mute { id, .. }
            | Frame::Unmute { id, .. }
            | Frame::History { id, .. }
            | Frame::Watch { id, .. }
            | Frame::Unwatch { id, .. }
            | Frame::WatchAll { id, .. }
            | Frame::WatchActive { id, .. }
            | Frame::Hide { id, .. }
            | Frame::Permit { id, .. }
            | Frame::Unpermit { id, .. } => Some(*id),
            Frame::Say { id, .. } => *id,
            _ => None,
        }
    }

    /// Create a new Login frame at the current protocol version.
    #[must_use]
    pub fn login(name: impl Into<String>) -> Self {
        Frame::Login {
            name: name.into(),
            version: Version::default(),
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(id: u64, channel: impl Into<String>) -> Self {
        Frame::Join {
            id,
            channel: channel.into(),
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(id: u64, channel: impl Into<String>) -> Self {
        Frame::Leave {
            id,
            channel: channel.into(),
        }
    }

    /// Create a new Say frame without acknowledgment.
    #[must_use]
    pub fn say(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Frame::Say {
            id: None,
            channel: channel.into(),
            text: text.into(),
        }
    }

    /// Create a new Say frame with ID for acknowledgment.
    #[must_use]
    pub fn say_with_ack(id: u64, channel: impl Into<String>, text: impl Into<String>) -> Self {
        Frame::Say {
            id: Some(id),
            channel: channel.into(),
            text: text.into(),
        }
    }

    /// Create a new Watch frame.
    #[must_use]
    pub fn watch(id: u64, name: impl Into<String>) -> Self {
        Frame::Watch {
            id,
            name: name.into(),
        }
    }

    /// Create a new Welcome frame.
    #[must_use]
    pub fn welcome(name: impl Into<String>, heartbeat: u32, channels: Vec<String>) -> Self {
        Frame::Welcome {
            name: name.into(),
            version: Version::default(),
            heartbeat,
            channels,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new ChannelLine frame.
    #[must_use]
    pub fn channel_line(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Frame::ChannelLine {
            channel: channel.into(),
            text: text.into(),
        }
    }

    /// Create a new Notice frame.
    #[must_use]
    pub fn notice(text: impl Into<String>) -> Self {
        Frame::Notice { text: text.into() }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}
