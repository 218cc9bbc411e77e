//! Fan-out of one PTY to many browser connections.
//!
//! The broadcaster is a single-owner actor: the client set, the scrollback
//! buffer and the session lifecycle are only touched by its own task, which
//! consumes one command channel fed by client connections, by the PTY pump
//! threads and by the session manager. Blocking PTY calls live on dedicated
//! OS threads; fan-out uses `try_send` into per-client bounded queues.

use super::client::{Attachment, ClientId, ClientInfo, ClientSlot, SendOutcome};
use super::pty::{ExitStatus, PtyProcess};
use super::scrollback::ScrollbackBuffer;
use super::{generate_session_id, SessionState};
use bytes::Bytes;
use sip_core::{CloseReason, ClosedInfo, SipError, SipResult, WindowSize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Size of a single PTY read.
const READ_CHUNK: usize = 8192;

/// Depth of the actor's command channel.
const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Scrollback capacity in bytes (0 disables replay).
    pub scrollback_bytes: usize,
    /// Outbound frames queued per client before it is dropped.
    pub client_queue_depth: usize,
    pub max_clients: usize,
    /// End the session after this long without attached clients.
    pub idle_timeout: Option<Duration>,
    /// How long to wait after SIGTERM (and again after SIGKILL).
    pub shutdown_grace: Duration,
    /// How long to keep reading after the child exited before closing anyway.
    pub drain_timeout: Duration,
    /// Input chunks buffered ahead of the PTY writer. A client that fills
    /// the queue waits for room; its keystrokes are never dropped.
    pub input_queue_depth: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            scrollback_bytes: 256 * 1024,
            client_queue_depth: 256,
            max_clients: 64,
            idle_timeout: None,
            shutdown_grace: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(500),
            input_queue_depth: 256,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub pid: Option<u32>,
    pub state: SessionState,
    /// Size as reported by the PTY.
    pub window_size: WindowSize,
    pub clients: Vec<ClientInfo>,
    pub scrollback_bytes: usize,
    pub total_output: u64,
}

enum Command {
    Attach {
        peer: String,
        reply: oneshot::Sender<SipResult<Attachment>>,
    },
    Detach {
        client_id: ClientId,
    },
    Resize {
        client_id: ClientId,
        size: WindowSize,
    },
    Inspect {
        reply: oneshot::Sender<SessionInfo>,
    },
    Shutdown {
        reason: CloseReason,
    },
    Output(Bytes),
    OutputClosed(Option<String>),
    Exited(SipResult<ExitStatus>),
}

/// Cloneable handle used by connections and the manager.
#[derive(Clone)]
pub struct BroadcasterHandle {
    session_id: Arc<str>,
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl BroadcasterHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Register a client. Its queue starts with the scrollback snapshot.
    pub async fn attach(&self, peer: impl Into<String>) -> SipResult<Attachment> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Attach {
                peer: peer.into(),
                reply,
            })
            .await
            .map_err(|_| SipError::SessionEnded)?;
        rx.await.map_err(|_| SipError::SessionEnded)?
    }

    pub async fn detach(&self, client_id: ClientId) {
        let _ = self.tx.send(Command::Detach { client_id }).await;
    }

    pub async fn resize(&self, client_id: ClientId, size: WindowSize) -> SipResult<()> {
        self.tx
            .send(Command::Resize { client_id, size })
            .await
            .map_err(|_| SipError::SessionEnded)
    }

    pub async fn inspect(&self) -> SipResult<SessionInfo> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Inspect { reply })
            .await
            .map_err(|_| SipError::SessionEnded)?;
        rx.await.map_err(|_| SipError::SessionEnded)
    }

    /// Start terminating the child. Completion is observable via [`closed`](Self::closed).
    pub async fn shutdown(&self, reason: CloseReason) {
        let _ = self.tx.send(Command::Shutdown { reason }).await;
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches a terminal state.
    pub async fn closed(&self) -> ClosedInfo {
        let mut state = self.state.clone();
        loop {
            if let Some(info) = state.borrow_and_update().closed_info().cloned() {
                return info;
            }
            if state.changed().await.is_err() {
                return state.borrow().closed_info().cloned().unwrap_or_else(|| {
                    ClosedInfo::new(CloseReason::Failed, None).with_message("session dropped")
                });
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    Terminated,
    Killed,
}

/// The actor. Created by [`SessionBroadcaster::spawn`].
pub struct SessionBroadcaster {
    session_id: String,
    pty: Arc<dyn PtyProcess>,
    config: BroadcasterConfig,
    /// Kept so pump threads can be started on demand.
    tx: mpsc::Sender<Command>,
    state_tx: watch::Sender<SessionState>,
    clients: HashMap<ClientId, ClientSlot>,
    next_client_id: ClientId,
    scrollback: ScrollbackBuffer,
    /// Cloned into every attachment; released when the session ends.
    input_tx: Option<mpsc::Sender<Bytes>>,
    size: WindowSize,
    pumps_started: bool,
    exit: Option<ExitStatus>,
    child_gone: bool,
    output_closed: bool,
    close_reason: Option<CloseReason>,
    failure: Option<String>,
    escalation: Option<Escalation>,
    drain_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    escalate_deadline: Option<Instant>,
    finished: Option<ClosedInfo>,
}

impl SessionBroadcaster {
    /// Start the actor for an already spawned PTY.
    ///
    /// The returned join handle resolves with the session's final status.
    pub fn spawn(
        pty: Arc<dyn PtyProcess>,
        config: BroadcasterConfig,
    ) -> SipResult<(BroadcasterHandle, JoinHandle<ClosedInfo>)> {
        let session_id = generate_session_id();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);

        let (input_tx, input_rx) = mpsc::channel(config.input_queue_depth.max(1));
        spawn_writer(pty.clone(), input_rx, &session_id)?;

        let size = pty.window_size().unwrap_or_default();
        let actor = Self {
            session_id: session_id.clone(),
            pty,
            scrollback: ScrollbackBuffer::new(config.scrollback_bytes),
            config,
            tx: tx.clone(),
            state_tx,
            clients: HashMap::new(),
            next_client_id: 1,
            input_tx: Some(input_tx),
            size,
            pumps_started: false,
            exit: None,
            child_gone: false,
            output_closed: false,
            close_reason: None,
            failure: None,
            escalation: None,
            drain_deadline: None,
            idle_deadline: None,
            escalate_deadline: None,
            finished: None,
        };

        let handle = BroadcasterHandle {
            session_id: session_id.into(),
            tx,
            state: state_rx,
        };
        let join = tokio::spawn(actor.run(rx));
        Ok((handle, join))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) -> ClosedInfo {
        info!(session_id = %self.session_id, pid = self.pty.pid(), "session broadcaster started");
        loop {
            if let Some(info) = self.finished.take() {
                info!(
                    session_id = %self.session_id,
                    reason = %info.reason,
                    code = info.exit_code,
                    "session closed"
                );
                return info;
            }

            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => {
                        self.failure = Some("command channel closed".into());
                        self.finish();
                    }
                },
                _ = sleep_until_opt(self.drain_deadline) => {
                    debug!(session_id = %self.session_id, "PTY still open after child exit, closing anyway");
                    self.drain_deadline = None;
                    self.finish();
                }
                _ = sleep_until_opt(self.idle_deadline) => {
                    self.idle_deadline = None;
                    if self.clients.is_empty() {
                        info!(session_id = %self.session_id, "no clients attached, ending idle session");
                        self.begin_shutdown(CloseReason::IdleTimeout);
                    }
                }
                _ = sleep_until_opt(self.escalate_deadline) => {
                    self.escalate_deadline = None;
                    self.escalate();
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Attach { peer, reply } => self.attach(peer, reply),
            Command::Detach { client_id } => {
                if self.clients.remove(&client_id).is_some() {
                    info!(
                        session_id = %self.session_id,
                        client_id,
                        clients = self.clients.len(),
                        "client detached"
                    );
                    self.arm_idle_timer();
                }
            }
            Command::Resize { client_id, size } => self.resize(client_id, size),
            Command::Inspect { reply } => {
                let _ = reply.send(self.info());
            }
            Command::Shutdown { reason } => self.begin_shutdown(reason),
            Command::Output(data) => {
                self.scrollback.append(&data);
                self.fan_out(data);
            }
            Command::OutputClosed(err) => {
                match err {
                    Some(e) => debug!(session_id = %self.session_id, error = %e, "PTY read ended"),
                    None => debug!(session_id = %self.session_id, "PTY output closed"),
                }
                self.output_closed = true;
                if self.child_gone {
                    self.finish();
                }
            }
            Command::Exited(result) => {
                self.child_gone = true;
                self.escalate_deadline = None;
                match result {
                    Ok(status) => self.exit = Some(status),
                    Err(e) => {
                        warn!(session_id = %self.session_id, error = %e, "failed to reap child");
                        self.failure = Some(e.to_string());
                    }
                }
                if self.output_closed {
                    self.finish();
                } else {
                    self.drain_deadline = Some(Instant::now() + self.config.drain_timeout);
                }
            }
        }
    }

    fn ended(&self) -> bool {
        self.finished.is_some() || self.close_reason.is_some() || self.child_gone
    }

    fn attach(&mut self, peer: String, reply: oneshot::Sender<SipResult<Attachment>>) {
        if self.ended() {
            let _ = reply.send(Err(SipError::SessionEnded));
            return;
        }
        if self.clients.len() >= self.config.max_clients {
            warn!(session_id = %self.session_id, peer = %peer, "rejecting client: session full");
            let _ = reply.send(Err(SipError::TooManyClients(self.config.max_clients)));
            return;
        }

        let Some(input) = self.input_tx.clone() else {
            let _ = reply.send(Err(SipError::SessionEnded));
            return;
        };

        let client_id = self.next_client_id;
        self.next_client_id += 1;
        let (slot, output) = ClientSlot::new(client_id, peer, self.config.client_queue_depth);

        // The snapshot goes in before the client becomes eligible for fan-out.
        let snapshot = self.scrollback.snapshot();
        let snapshot_bytes = snapshot.len();
        if !snapshot.is_empty() {
            slot.send(Bytes::from(snapshot));
        }

        let attachment = Attachment {
            client_id,
            session_id: self.session_id.clone(),
            output,
            input,
            state: self.state_tx.subscribe(),
        };
        if reply.send(Ok(attachment)).is_err() {
            debug!(session_id = %self.session_id, client_id, "client left before attach completed");
            return;
        }

        info!(
            session_id = %self.session_id,
            client_id,
            peer = %slot.peer,
            snapshot_bytes,
            clients = self.clients.len() + 1,
            "client attached"
        );
        self.clients.insert(client_id, slot);
        self.idle_deadline = None;

        if !self.pumps_started {
            self.start_pumps();
        }
    }

    fn resize(&mut self, client_id: ClientId, size: WindowSize) {
        if self.ended() || !self.clients.contains_key(&client_id) {
            return;
        }
        if let Err(e) = size.validate().and_then(|_| self.pty.resize(size)) {
            warn!(
                session_id = %self.session_id,
                client_id,
                rows = size.rows,
                cols = size.cols,
                error = %e,
                "ignoring resize"
            );
            return;
        }
        self.size = size;
        if let Some(slot) = self.clients.get_mut(&client_id) {
            slot.viewport = Some(size);
        }
        debug!(session_id = %self.session_id, client_id, rows = size.rows, cols = size.cols, "terminal resized");
    }

    fn fan_out(&mut self, data: Bytes) {
        let mut dropped = Vec::new();
        for (id, slot) in &self.clients {
            match slot.send(data.clone()) {
                SendOutcome::Delivered => {}
                SendOutcome::Overflow => {
                    warn!(
                        session_id = %self.session_id,
                        client_id = id,
                        peer = %slot.peer,
                        "client outbound queue full, disconnecting slow consumer"
                    );
                    dropped.push(*id);
                }
                SendOutcome::Closed => dropped.push(*id),
            }
        }
        if dropped.is_empty() {
            return;
        }
        for id in dropped {
            self.clients.remove(&id);
        }
        self.arm_idle_timer();
    }

    fn arm_idle_timer(&mut self) {
        if !self.clients.is_empty() || self.ended() {
            return;
        }
        if let Some(timeout) = self.config.idle_timeout {
            debug!(session_id = %self.session_id, ?timeout, "no clients attached, idle timer armed");
            self.idle_deadline = Some(Instant::now() + timeout);
        }
    }

    fn start_pumps(&mut self) {
        self.pumps_started = true;
        let started = spawn_reader(self.pty.clone(), self.tx.clone(), &self.session_id)
            .and_then(|_| spawn_waiter(self.pty.clone(), self.tx.clone(), &self.session_id));
        match started {
            Ok(()) => {
                self.state_tx.send_replace(SessionState::Running);
            }
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "failed to start PTY pumps");
                self.failure = Some(e.to_string());
                if let Err(e) = self.pty.kill() {
                    error!(session_id = %self.session_id, error = %e, "failed to kill child");
                }
                self.finish();
            }
        }
    }

    fn begin_shutdown(&mut self, reason: CloseReason) {
        if self.finished.is_some() || self.close_reason.is_some() {
            return;
        }
        info!(session_id = %self.session_id, %reason, "shutting session down");
        self.close_reason = Some(reason);
        self.idle_deadline = None;
        if !self.pumps_started {
            self.start_pumps();
        }
        if self.child_gone {
            return;
        }
        match self.pty.terminate() {
            Ok(()) => {
                self.escalation = Some(Escalation::Terminated);
                self.escalate_deadline = Some(Instant::now() + self.config.shutdown_grace);
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "graceful termination failed");
                self.escalation = Some(Escalation::Terminated);
                self.escalate();
            }
        }
    }

    fn escalate(&mut self) {
        if self.child_gone {
            return;
        }
        match self.escalation {
            Some(Escalation::Terminated) => {
                warn!(session_id = %self.session_id, pid = self.pty.pid(), "child still running, killing");
                if let Err(e) = self.pty.kill() {
                    error!(session_id = %self.session_id, error = %e, "failed to kill child");
                }
                self.escalation = Some(Escalation::Killed);
                self.escalate_deadline = Some(Instant::now() + self.config.shutdown_grace);
            }
            Some(Escalation::Killed) => {
                error!(session_id = %self.session_id, pid = self.pty.pid(), "child survived kill, abandoning it");
                self.failure = Some("child did not exit after kill".into());
                self.finish();
            }
            None => {}
        }
    }

    fn finish(&mut self) {
        if self.finished.is_some() {
            return;
        }
        let reason = self.close_reason.unwrap_or(if self.failure.is_some() {
            CloseReason::Failed
        } else {
            CloseReason::Exited
        });
        let mut info = ClosedInfo::new(reason, self.exit.map(|s| s.code));
        let state = match self.failure.take() {
            Some(msg) => {
                info = info.with_message(msg);
                SessionState::Failed(info.clone())
            }
            None => SessionState::Exited(info.clone()),
        };

        // Publish before releasing queues: connections drain what is queued,
        // then send the close frame.
        self.state_tx.send_replace(state);
        self.clients.clear();
        self.input_tx = None;
        self.drain_deadline = None;
        self.idle_deadline = None;
        self.escalate_deadline = None;
        self.finished = Some(info);
    }

    fn info(&self) -> SessionInfo {
        let mut clients: Vec<ClientInfo> = self.clients.values().map(ClientSlot::info).collect();
        clients.sort_by_key(|c| c.id);
        SessionInfo {
            session_id: self.session_id.clone(),
            pid: self.pty.pid(),
            state: self.state_tx.borrow().clone(),
            window_size: self.pty.window_size().unwrap_or(self.size),
            clients,
            scrollback_bytes: self.scrollback.len(),
            total_output: self.scrollback.total_written(),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn spawn_reader(
    pty: Arc<dyn PtyProcess>,
    tx: mpsc::Sender<Command>,
    session_id: &str,
) -> SipResult<()> {
    std::thread::Builder::new()
        .name(format!("sip-pty-read-{}", &session_id[..8.min(session_id.len())]))
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match pty.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.blocking_send(Command::OutputClosed(None));
                        break;
                    }
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if tx.blocking_send(Command::Output(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.blocking_send(Command::OutputClosed(Some(e.to_string())));
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

fn spawn_waiter(
    pty: Arc<dyn PtyProcess>,
    tx: mpsc::Sender<Command>,
    session_id: &str,
) -> SipResult<()> {
    std::thread::Builder::new()
        .name(format!("sip-pty-wait-{}", &session_id[..8.min(session_id.len())]))
        .spawn(move || {
            let result = pty.wait();
            let _ = tx.blocking_send(Command::Exited(result));
        })?;
    Ok(())
}

fn spawn_writer(
    pty: Arc<dyn PtyProcess>,
    mut rx: mpsc::Receiver<Bytes>,
    session_id: &str,
) -> SipResult<()> {
    let session_id = session_id.to_string();
    std::thread::Builder::new()
        .name(format!("sip-pty-write-{}", &session_id[..8.min(session_id.len())]))
        .spawn(move || {
            while let Some(data) = rx.blocking_recv() {
                if let Err(e) = pty.write_all(&data) {
                    debug!(session_id = %session_id, error = %e, "PTY write failed, stopping writer");
                    break;
                }
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::FakePty;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> BroadcasterConfig {
        BroadcasterConfig {
            scrollback_bytes: 1024,
            client_queue_depth: 64,
            shutdown_grace: Duration::from_millis(100),
            drain_timeout: Duration::from_millis(100),
            ..BroadcasterConfig::default()
        }
    }

    async fn next(att: &mut Attachment) -> Bytes {
        tokio::time::timeout(WAIT, att.output.recv())
            .await
            .expect("timed out waiting for output")
            .expect("output queue closed")
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn closed(handle: &BroadcasterHandle) -> ClosedInfo {
        tokio::time::timeout(WAIT, handle.closed()).await.expect("session did not close")
    }

    #[tokio::test]
    async fn first_attach_starts_output() {
        let pty = FakePty::new();
        pty.emit(b"early ");
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        assert_eq!(*handle.state().borrow(), SessionState::Starting);

        let mut a = handle.attach("a").await.unwrap();
        pty.emit(b"late");
        assert_eq!(next(&mut a).await, Bytes::from_static(b"early "));
        assert_eq!(next(&mut a).await, Bytes::from_static(b"late"));
        assert_eq!(*handle.state().borrow(), SessionState::Running);
    }

    #[tokio::test]
    async fn late_attach_gets_snapshot_then_live_without_seam() {
        let pty = FakePty::new();
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        let mut a = handle.attach("a").await.unwrap();

        pty.emit(b"abc");
        pty.emit(b"def");
        assert_eq!(next(&mut a).await, Bytes::from_static(b"abc"));
        assert_eq!(next(&mut a).await, Bytes::from_static(b"def"));

        let mut b = handle.attach("b").await.unwrap();
        pty.emit(b"ghi");

        assert_eq!(next(&mut b).await, Bytes::from_static(b"abcdef"));
        assert_eq!(next(&mut b).await, Bytes::from_static(b"ghi"));
        assert_eq!(next(&mut a).await, Bytes::from_static(b"ghi"));
        assert!(b.output.try_recv().is_err());
    }

    #[tokio::test]
    async fn snapshot_is_bounded_by_capacity() {
        let pty = FakePty::new();
        let cfg = BroadcasterConfig {
            scrollback_bytes: 4,
            ..config()
        };
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), cfg).unwrap();
        let mut a = handle.attach("a").await.unwrap();
        pty.emit(b"0123456789");
        next(&mut a).await;

        let mut b = handle.attach("b").await.unwrap();
        assert_eq!(next(&mut b).await, Bytes::from_static(b"6789"));
        let info = handle.inspect().await.unwrap();
        assert_eq!(info.scrollback_bytes, 4);
        assert_eq!(info.total_output, 10);
    }

    #[tokio::test]
    async fn all_clients_see_the_same_order() {
        let pty = FakePty::new();
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        let mut a = handle.attach("a").await.unwrap();
        let mut b = handle.attach("b").await.unwrap();

        let chunks: Vec<String> = (0..20).map(|i| format!("line {i}\n")).collect();
        for c in &chunks {
            pty.emit(c.as_bytes());
        }
        let expected: Vec<u8> = chunks.concat().into_bytes();
        for att in [&mut a, &mut b] {
            let mut got = Vec::new();
            while got.len() < expected.len() {
                got.extend_from_slice(&next(att).await);
            }
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn slow_client_is_dropped_fast_client_unaffected() {
        let pty = FakePty::new();
        let cfg = BroadcasterConfig {
            client_queue_depth: 4,
            ..config()
        };
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), cfg).unwrap();
        let mut fast = handle.attach("fast").await.unwrap();
        let mut slow = handle.attach("slow").await.unwrap();

        for i in 0..12u8 {
            pty.emit(&[i]);
            assert_eq!(next(&mut fast).await, Bytes::copy_from_slice(&[i]));
        }

        let info = handle.inspect().await.unwrap();
        assert_eq!(info.clients.len(), 1);
        assert_eq!(info.clients[0].id, fast.client_id);

        let mut queued = Vec::new();
        while let Some(chunk) = slow.output.recv().await {
            queued.extend_from_slice(&chunk);
        }
        assert_eq!(queued, vec![0, 1, 2, 3]);
        assert!(!slow.state.borrow().is_terminal());
    }

    #[tokio::test]
    async fn detaching_last_client_keeps_session_alive() {
        let pty = FakePty::new();
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        let a = handle.attach("a").await.unwrap();
        handle.detach(a.client_id).await;

        pty.emit(b"headless");
        let mut b = handle.attach("b").await.unwrap();
        let mut got = Vec::new();
        while got.len() < b"headless".len() {
            got.extend_from_slice(&next(&mut b).await);
        }
        assert_eq!(got, b"headless");

        pty.emit(b"live");
        assert_eq!(next(&mut b).await, Bytes::from_static(b"live"));
        assert_eq!(handle.inspect().await.unwrap().state, SessionState::Running);
    }

    #[tokio::test]
    async fn input_is_forwarded_in_arrival_order() {
        let pty = FakePty::new();
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        let a = handle.attach("a").await.unwrap();
        let b = handle.attach("b").await.unwrap();

        a.input.send(Bytes::from_static(b"ls")).await.unwrap();
        b.input.send(Bytes::from_static(b" -la")).await.unwrap();
        a.input.send(Bytes::from_static(b"\r")).await.unwrap();

        wait_for(|| pty.written().len() >= 7).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pty.written(), b"ls -la\r");
    }

    #[tokio::test]
    async fn backed_up_writer_delays_input_without_losing_it() {
        let pty = FakePty::new();
        pty.stall_writes();
        let cfg = BroadcasterConfig {
            input_queue_depth: 4,
            ..config()
        };
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), cfg).unwrap();
        let a = handle.attach("a").await.unwrap();
        let mut b = handle.attach("b").await.unwrap();

        let typed: Vec<u8> = (b'a'..=b'z').collect();
        let input = a.input.clone();
        let keys = typed.clone();
        let typing = tokio::spawn(async move {
            for key in keys {
                input.send(Bytes::copy_from_slice(&[key])).await.unwrap();
            }
        });

        // The typist is held back while the other client keeps receiving output.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!typing.is_finished());
        pty.emit(b"still live");
        assert_eq!(next(&mut b).await, Bytes::from_static(b"still live"));

        pty.release_writes();
        tokio::time::timeout(WAIT, typing).await.unwrap().unwrap();
        wait_for(|| pty.written().len() >= typed.len()).await;
        assert_eq!(pty.written(), typed);
    }

    #[tokio::test]
    async fn resize_is_last_writer_wins() {
        let pty = FakePty::new();
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        let a = handle.attach("a").await.unwrap();
        let b = handle.attach("b").await.unwrap();

        handle.resize(a.client_id, WindowSize::new(40, 120)).await.unwrap();
        assert_eq!(handle.inspect().await.unwrap().window_size, WindowSize::new(40, 120));

        handle.resize(b.client_id, WindowSize::new(30, 100)).await.unwrap();
        handle.resize(a.client_id, WindowSize::new(0, 100)).await.unwrap();

        let info = handle.inspect().await.unwrap();
        assert_eq!(info.window_size, WindowSize::new(30, 100));
        assert_eq!(info.clients[0].viewport, Some(WindowSize::new(40, 120)));
        assert_eq!(info.clients[1].viewport, Some(WindowSize::new(30, 100)));
    }

    #[tokio::test]
    async fn exit_closes_session_after_output() {
        let pty = FakePty::new();
        let (handle, join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        let mut a = handle.attach("a").await.unwrap();

        pty.emit(b"bye\r\n");
        pty.exit(0);

        assert_eq!(next(&mut a).await, Bytes::from_static(b"bye\r\n"));
        let info = closed(&handle).await;
        assert_eq!(info, ClosedInfo::new(CloseReason::Exited, Some(0)));
        assert!(a.output.recv().await.is_none());
        assert_eq!(join.await.unwrap(), info);

        assert!(matches!(handle.attach("late").await, Err(SipError::SessionEnded)));
    }

    #[tokio::test]
    async fn exit_with_pty_held_open_closes_after_drain_timeout() {
        let pty = FakePty::new();
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        let _a = handle.attach("a").await.unwrap();

        pty.report_exit(2);
        let info = closed(&handle).await;
        assert_eq!(info.exit_code, Some(2));
        assert_eq!(info.reason, CloseReason::Exited);
    }

    #[tokio::test]
    async fn shutdown_terminates_gracefully() {
        let pty = FakePty::new();
        let (handle, join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        let a = handle.attach("a").await.unwrap();

        handle.shutdown(CloseReason::Shutdown).await;
        let info = tokio::time::timeout(WAIT, join).await.unwrap().unwrap();
        assert_eq!(info, ClosedInfo::new(CloseReason::Shutdown, Some(143)));
        assert_eq!(pty.terminate_calls(), 1);
        assert_eq!(pty.kill_calls(), 0);
        assert_eq!(a.state.borrow().closed_info(), Some(&info));
    }

    #[tokio::test]
    async fn shutdown_escalates_to_kill() {
        let pty = FakePty::new();
        pty.ignore_terminate();
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        let _a = handle.attach("a").await.unwrap();

        handle.shutdown(CloseReason::Shutdown).await;
        let info = closed(&handle).await;
        assert_eq!(info.exit_code, Some(137));
        assert_eq!(pty.terminate_calls(), 1);
        assert_eq!(pty.kill_calls(), 1);
    }

    #[tokio::test]
    async fn unkillable_child_is_reported_not_waited_on() {
        let pty = FakePty::new();
        pty.ignore_terminate();
        pty.ignore_kill();
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        let a = handle.attach("a").await.unwrap();

        handle.shutdown(CloseReason::Shutdown).await;
        let info = closed(&handle).await;
        assert_eq!(info.reason, CloseReason::Shutdown);
        assert_eq!(info.exit_code, None);
        assert!(info.message.is_some());
        assert!(matches!(*a.state.borrow(), SessionState::Failed(_)));
    }

    #[tokio::test]
    async fn shutdown_before_any_attach() {
        let pty = FakePty::new();
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), config()).unwrap();
        handle.shutdown(CloseReason::Shutdown).await;
        assert_eq!(closed(&handle).await.reason, CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn idle_timeout_ends_headless_session() {
        let pty = FakePty::new();
        let cfg = BroadcasterConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            ..config()
        };
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), cfg).unwrap();
        let a = handle.attach("a").await.unwrap();
        handle.detach(a.client_id).await;

        let info = closed(&handle).await;
        assert_eq!(info.reason, CloseReason::IdleTimeout);
        assert_eq!(pty.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn reattach_cancels_idle_timeout() {
        let pty = FakePty::new();
        let cfg = BroadcasterConfig {
            idle_timeout: Some(Duration::from_millis(200)),
            ..config()
        };
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), cfg).unwrap();
        let a = handle.attach("a").await.unwrap();
        handle.detach(a.client_id).await;
        let _b = handle.attach("b").await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handle.inspect().await.unwrap().state, SessionState::Running);
        assert_eq!(pty.terminate_calls(), 0);
    }

    #[tokio::test]
    async fn max_clients_is_enforced() {
        let pty = FakePty::new();
        let cfg = BroadcasterConfig {
            max_clients: 1,
            ..config()
        };
        let (handle, _join) = SessionBroadcaster::spawn(pty.clone(), cfg).unwrap();
        let _a = handle.attach("a").await.unwrap();
        assert!(matches!(
            handle.attach("b").await,
            Err(SipError::TooManyClients(1))
        ));
    }
}
