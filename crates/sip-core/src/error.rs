use thiserror::Error;

/// Errors produced by the sip terminal bridge.
#[derive(Debug, Error)]
pub enum SipError {
    /// The wrapped command could not be started.
    #[error("failed to spawn `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    /// The session has ended; no further attaches, reads or writes.
    #[error("session ended")]
    SessionEnded,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u32, cols: u32 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("too many clients (max {0})")]
    TooManyClients(usize),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SipError {
    /// Shorthand for a [`SipError::Spawn`].
    pub fn spawn(program: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SipError::Spawn {
            program: program.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for SipError {
    fn from(e: serde_json::Error) -> Self {
        SipError::InvalidMessage(e.to_string())
    }
}

pub type SipResult<T> = Result<T, SipError>;
