//! Session core: PTY lifecycle, scrollback, client queues, broadcaster.

pub mod broadcaster;
pub mod client;
pub mod pty;
pub mod scrollback;

#[cfg(test)]
pub(crate) mod fake;

pub use broadcaster::{BroadcasterConfig, BroadcasterHandle, SessionBroadcaster, SessionInfo};
pub use client::{Attachment, ClientId, ClientInfo, SendOutcome};
pub use pty::{ExitStatus, NativePtySpawner, PtyProcess, PtySpawner, SpawnSpec};
pub use scrollback::ScrollbackBuffer;

use sip_core::ClosedInfo;

/// Lifecycle of the wrapped command as seen by attached clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Spawned; output pumps start when the first client attaches.
    Starting,
    Running,
    /// The child is gone (exited, terminated on shutdown or idle timeout).
    Exited(ClosedInfo),
    /// The PTY broke or the child could not be reaped.
    Failed(ClosedInfo),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Exited(_) | SessionState::Failed(_))
    }

    pub fn closed_info(&self) -> Option<&ClosedInfo> {
        match self {
            SessionState::Exited(info) | SessionState::Failed(info) => Some(info),
            _ => None,
        }
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
