//! Message types exchanged between the browser terminal and the server.

use crate::error::{SipError, SipResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Largest row or column count accepted from a client.
pub const MAX_DIMENSION: u16 = 4096;

/// Binary frame tags. The first byte of every binary WebSocket message.
pub mod tag {
    pub const DATA: u8 = 0x00;
    pub const RESIZE: u8 = 0x01;
    pub const SESSION_CLOSED: u8 = 0x01;
    pub const PING: u8 = 0x02;
    pub const PONG: u8 = 0x03;
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Build a size from unchecked client-supplied values.
    pub fn checked(rows: u32, cols: u32) -> SipResult<Self> {
        let invalid = || SipError::InvalidSize { rows, cols };
        let r = u16::try_from(rows).map_err(|_| invalid())?;
        let c = u16::try_from(cols).map_err(|_| invalid())?;
        let size = Self::new(r, c);
        size.validate()?;
        Ok(size)
    }

    /// Reject zero-sized and absurdly large terminals.
    pub fn validate(&self) -> SipResult<()> {
        if self.rows == 0 || self.cols == 0 || self.rows > MAX_DIMENSION || self.cols > MAX_DIMENSION
        {
            return Err(SipError::InvalidSize {
                rows: self.rows as u32,
                cols: self.cols as u32,
            });
        }
        Ok(())
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The wrapped command exited on its own.
    Exited,
    /// The server is shutting down.
    Shutdown,
    /// No client was attached for longer than the idle timeout.
    IdleTimeout,
    /// The PTY failed (read error, wait error, or kill failure).
    Failed,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Exited => "exited",
            CloseReason::Shutdown => "shutdown",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Payload of the `SessionClosed` frame, also returned by the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedInfo {
    pub reason: CloseReason,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClosedInfo {
    pub fn new(reason: CloseReason, exit_code: Option<i32>) -> Self {
        Self {
            reason,
            exit_code,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A message from the browser to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Keystrokes or pasted text, forwarded verbatim to the PTY.
    Data(Bytes),
    /// The client's viewport changed.
    Resize(WindowSize),
    /// Liveness check; answered with a `Pong` carrying the same payload.
    Ping(Bytes),
    /// Liveness answer; no terminal effect.
    Pong(Bytes),
}

/// A message from the server to the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Raw terminal output.
    Data(Bytes),
    /// The session is over; the connection closes after this frame.
    SessionClosed(ClosedInfo),
    /// Answer to a client `Ping`.
    Pong(Bytes),
}

/// JSON form of [`ClientFrame`] accepted on text WebSocket messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextMessage {
    Input { data: String },
    Resize { rows: u32, cols: u32 },
    Ping,
    Pong,
}

impl TryFrom<TextMessage> for ClientFrame {
    type Error = SipError;

    fn try_from(msg: TextMessage) -> SipResult<Self> {
        Ok(match msg {
            TextMessage::Input { data } => ClientFrame::Data(Bytes::from(data)),
            TextMessage::Resize { rows, cols } => {
                ClientFrame::Resize(WindowSize::checked(rows, cols)?)
            }
            TextMessage::Ping => ClientFrame::Ping(Bytes::new()),
            TextMessage::Pong => ClientFrame::Pong(Bytes::new()),
        })
    }
}
