//! Session manager: owns the listener and the single session slot.
//!
//! The wrapped command is spawned lazily when the first browser connects.
//! Every accepted connection is attached to that one session on its own
//! task; the manager returns once the session is over and the connection
//! tasks have wound down.

use crate::config::ServerConfig;
use crate::session::pty::preflight;
use crate::session::{
    BroadcasterHandle, NativePtySpawner, PtySpawner, SessionBroadcaster, SpawnSpec,
};
use crate::transport::{self, serve_client};
use sip_core::{CloseReason, ClosedInfo, SipError, SipResult};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for connection tasks after the session closed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// The live session, once spawned.
type SessionSlot = Option<(BroadcasterHandle, JoinHandle<ClosedInfo>)>;

enum Outcome {
    Cancelled,
    Ended(SipResult<ClosedInfo>),
    Failed(SipError),
}

pub struct SessionManager {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    spawner: Arc<dyn PtySpawner>,
}

impl SessionManager {
    /// Bind the listener for `config`, spawning commands on native PTYs.
    pub async fn bind(config: ServerConfig) -> SipResult<Self> {
        Self::with_spawner(config, Arc::new(NativePtySpawner)).await
    }

    pub async fn with_spawner(
        config: ServerConfig,
        spawner: Arc<dyn PtySpawner>,
    ) -> SipResult<Self> {
        let listener = transport::bind(&config.host, config.port).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            config,
            listener,
            local_addr,
            spawner,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve `command` to browsers until it exits or `cancel` fires.
    ///
    /// `work_dir` overrides the configured working directory. Returns how the
    /// session ended; a command that cannot be started is an error.
    pub async fn serve_command(
        self,
        cancel: CancellationToken,
        command: &str,
        args: &[String],
        work_dir: Option<PathBuf>,
    ) -> SipResult<ClosedInfo> {
        let Self {
            config,
            listener,
            local_addr,
            spawner,
        } = self;

        let mut spec = SpawnSpec::new(
            command,
            args.to_vec(),
            work_dir.unwrap_or_else(|| config.work_dir.clone()),
        );
        spec.size = config.window_size;
        spec.term = config.term.clone();
        let program = preflight(&spec)?;
        info!(
            command = %spec.display(),
            program = %program.display(),
            cwd = %spec.cwd.display(),
            addr = %local_addr,
            path = %config.ws_path,
            "serving command"
        );

        let listener_cancel = cancel.child_token();
        let mut conns = transport::start_listener(listener, config.ws_path.clone(), listener_cancel.clone());
        let settings = config.client_settings();
        let tracker = TaskTracker::new();
        let mut slot: SessionSlot = None;
        let mut turned_away = Vec::new();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Outcome::Cancelled,
                res = session_ended(&mut slot) => break Outcome::Ended(res),
                conn = conns.recv() => {
                    let Some(conn) = conn else {
                        break Outcome::Failed(SipError::Transport("listener stopped".into()));
                    };
                    let handle = match ensure_session(&mut slot, &spawner, &spec, &config).await {
                        Ok(handle) => handle,
                        Err(e) => {
                            turned_away.push(conn);
                            break Outcome::Failed(e);
                        }
                    };
                    let peer = conn.remote_addr;
                    tracker.spawn(async move {
                        if let Err(e) = serve_client(conn, handle, settings).await {
                            debug!(peer = %peer, error = %e, "client ended with error");
                        }
                    });
                }
            }
        };

        listener_cancel.cancel();
        let result = match outcome {
            Outcome::Ended(res) => res,
            Outcome::Cancelled => {
                info!("shutdown requested");
                shutdown_session(slot).await
            }
            Outcome::Failed(e) => {
                error!(error = %e, "session manager failed");
                let _ = shutdown_session(slot).await;
                Err(e)
            }
        };

        // Handshakes that finished while the session was closing still get told why.
        while let Ok(conn) = conns.try_recv() {
            turned_away.push(conn);
        }
        if !turned_away.is_empty() {
            let closed = match &result {
                Ok(info) => info.clone(),
                Err(e) => ClosedInfo::new(CloseReason::Failed, None).with_message(e.to_string()),
            };
            for conn in turned_away {
                let closed = closed.clone();
                tracker.spawn(async move {
                    let reason = format!("session {}", closed.reason);
                    transport::reject(conn, Some(closed), &reason).await;
                });
            }
        }

        tracker.close();
        if tokio::time::timeout(CLOSE_TIMEOUT, tracker.wait()).await.is_err() {
            warn!(remaining = tracker.len(), "client connections did not close in time");
        }

        if let Ok(info) = &result {
            info!(reason = %info.reason, code = info.exit_code, "session finished");
        }
        result
    }
}

/// Spawn the session on first use, otherwise hand out the existing handle.
///
/// Forking the child blocks, so it runs on the blocking pool.
async fn ensure_session(
    slot: &mut SessionSlot,
    spawner: &Arc<dyn PtySpawner>,
    spec: &SpawnSpec,
    config: &ServerConfig,
) -> SipResult<BroadcasterHandle> {
    if let Some((handle, _)) = slot {
        return Ok(handle.clone());
    }
    let spawner = spawner.clone();
    let blocking_spec = spec.clone();
    let pty = tokio::task::spawn_blocking(move || spawner.spawn(&blocking_spec))
        .await
        .map_err(|e| SipError::spawn(&spec.program, format!("spawn task failed: {e}")))??;
    let (handle, join) = SessionBroadcaster::spawn(pty, config.broadcaster_config())?;
    info!(session_id = %handle.session_id(), command = %spec.display(), "session started");
    *slot = Some((handle.clone(), join));
    Ok(handle)
}

async fn session_ended(slot: &mut SessionSlot) -> SipResult<ClosedInfo> {
    match slot {
        Some((_, join)) => join
            .await
            .map_err(|e| SipError::Other(format!("session task failed: {e}"))),
        None => std::future::pending().await,
    }
}

/// Terminate the running session, if any, and wait for it to close.
async fn shutdown_session(slot: SessionSlot) -> SipResult<ClosedInfo> {
    match slot {
        Some((handle, join)) => {
            handle.shutdown(CloseReason::Shutdown).await;
            join.await
                .map_err(|e| SipError::Other(format!("session task failed: {e}")))
        }
        None => Ok(ClosedInfo::new(CloseReason::Shutdown, None)),
    }
}
