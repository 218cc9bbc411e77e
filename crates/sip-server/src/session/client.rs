//! Broadcaster-side view of one attached browser connection.
//!
//! Each client owns a bounded outbound queue. The broadcaster only ever
//! `try_send`s into it, so a stalled browser costs one queue and never
//! delays anyone else.

use super::SessionState;
use bytes::Bytes;
use sip_core::WindowSize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

pub type ClientId = u64;

/// Result of pushing output to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The queue is full; the client must be dropped.
    Overflow,
    /// The connection already went away.
    Closed,
}

/// Handed to a connection when it attaches.
#[derive(Debug)]
pub struct Attachment {
    pub client_id: ClientId,
    pub session_id: String,
    /// Scrollback snapshot first, then live output. Closed when the client is
    /// dropped or the session ends.
    pub output: mpsc::Receiver<Bytes>,
    /// Bytes sent here are written to the PTY in order. `send` waits while
    /// the writer is backed up.
    pub input: mpsc::Sender<Bytes>,
    pub state: watch::Receiver<SessionState>,
}

/// Snapshot of an attached client, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer: String,
    pub attached_for: Duration,
    pub viewport: Option<WindowSize>,
}

pub(crate) struct ClientSlot {
    pub id: ClientId,
    pub peer: String,
    pub attached_at: Instant,
    pub viewport: Option<WindowSize>,
    tx: mpsc::Sender<Bytes>,
}

impl ClientSlot {
    pub fn new(id: ClientId, peer: String, queue_depth: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let slot = Self {
            id,
            peer,
            attached_at: Instant::now(),
            viewport: None,
            tx,
        };
        (slot, rx)
    }

    /// Queue output for this client without waiting.
    pub fn send(&self, data: Bytes) -> SendOutcome {
        match self.tx.try_send(data) {
            Ok(()) => SendOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Overflow,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            peer: self.peer.clone(),
            attached_for: self.attached_at.elapsed(),
            viewport: self.viewport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_and_close_are_reported() {
        let (slot, mut rx) = ClientSlot::new(1, "test".into(), 2);
        assert_eq!(slot.send(Bytes::from_static(b"a")), SendOutcome::Delivered);
        assert_eq!(slot.send(Bytes::from_static(b"b")), SendOutcome::Delivered);
        assert_eq!(slot.send(Bytes::from_static(b"c")), SendOutcome::Overflow);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(slot.send(Bytes::from_static(b"d")), SendOutcome::Delivered);

        drop(rx);
        assert_eq!(slot.send(Bytes::from_static(b"e")), SendOutcome::Closed);
    }

    #[test]
    fn zero_depth_is_clamped() {
        let (slot, _rx) = ClientSlot::new(7, "test".into(), 0);
        assert_eq!(slot.send(Bytes::from_static(b"x")), SendOutcome::Delivered);
        assert_eq!(slot.info().id, 7);
    }
}
