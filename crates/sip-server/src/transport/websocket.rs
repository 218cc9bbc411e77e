//! WebSocket listener and per-connection bridge using tokio-tungstenite.
//!
//! The listener accepts upgrades on one path and hands finished handshakes
//! to the session manager. [`serve_client`] then attaches the connection to
//! the session broadcaster: a writer task drains the client's output queue
//! into the socket while the calling task decodes inbound frames.

use crate::session::{Attachment, BroadcasterHandle, ClientId, SessionState};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sip_core::{
    decode_client, decode_client_text, encode_server, ClientFrame, CloseReason, ClosedInfo,
    ServerFrame, SipError, SipResult,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum accepted inbound message size (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Liveness settings for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    /// Interval between server-sent WebSocket pings.
    pub ping_interval: Duration,
    /// Disconnect after this long without any inbound message.
    pub timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

/// Bind the TCP listener for `host:port`.
pub async fn bind(host: &str, port: u16) -> SipResult<TcpListener> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| SipError::Transport(format!("bind {host}:{port} failed: {e}")))?;
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "WebSocket listener bound");
    }
    Ok(listener)
}

/// Start accepting WebSocket upgrades on `ws_path`.
///
/// Returns a receiver that yields connections whose handshake completed.
/// The accept loop stops when `cancel` fires.
pub fn start_listener(
    listener: TcpListener,
    ws_path: String,
    cancel: CancellationToken,
) -> mpsc::Receiver<WebSocketConnection> {
    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let path = ws_path.clone();
                    tokio::spawn(async move {
                        let check_path = |req: &Request, resp: Response| {
                            if req.uri().path() == path {
                                Ok(resp)
                            } else {
                                debug!(remote = %addr, path = %req.uri().path(), "rejecting upgrade on unknown path");
                                let mut err = ErrorResponse::new(Some("not found".into()));
                                *err.status_mut() = StatusCode::NOT_FOUND;
                                Err(err)
                            }
                        };
                        let handshake = tokio::time::timeout(
                            HANDSHAKE_TIMEOUT,
                            tokio_tungstenite::accept_hdr_async(stream, check_path),
                        );
                        match handshake.await {
                            Ok(Ok(ws_stream)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    debug!(remote = %addr, "listener closed before connection was routed");
                                }
                            }
                            Ok(Err(e)) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                            Err(_) => {
                                warn!(remote = %addr, "WebSocket handshake timed out");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    rx
}

/// Bridge one connection to the session until either side goes away.
pub async fn serve_client(
    conn: WebSocketConnection,
    handle: BroadcasterHandle,
    settings: ClientSettings,
) -> SipResult<()> {
    let peer = conn.remote_addr.to_string();
    let mut ws = conn.ws_stream;

    let attachment = match handle.attach(peer.clone()).await {
        Ok(attachment) => attachment,
        Err(e) => {
            warn!(peer = %peer, error = %e, "attach rejected");
            let closed = match e {
                SipError::SessionEnded => Some(
                    handle
                        .state()
                        .borrow()
                        .closed_info()
                        .cloned()
                        .unwrap_or_else(|| ClosedInfo::new(CloseReason::Exited, None)),
                ),
                _ => None,
            };
            close_rejected(&mut ws, closed, &e.to_string()).await;
            return Err(e);
        }
    };
    let client_id = attachment.client_id;
    debug!(peer = %peer, client_id, session_id = %attachment.session_id, "client connected");

    let input = attachment.input.clone();
    let (sink, stream) = ws.split();
    let (control_tx, control_rx) = mpsc::channel::<Message>(16);
    let mut writer = tokio::spawn(write_loop(sink, attachment, control_rx, settings.ping_interval));

    tokio::select! {
        res = &mut writer => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(peer = %peer, client_id, error = %e, "client write failed"),
                Err(e) => warn!(peer = %peer, client_id, error = %e, "client writer panicked"),
            }
        }
        _ = read_loop(stream, &handle, client_id, &input, &control_tx, &peer, settings.timeout) => {
            writer.abort();
        }
    }

    handle.detach(client_id).await;
    debug!(peer = %peer, client_id, "client disconnected");
    Ok(())
}

/// Turn away a connection the session cannot take: send `SessionClosed`
/// when the session is over, then close.
pub async fn reject(conn: WebSocketConnection, closed: Option<ClosedInfo>, reason: &str) {
    let mut ws = conn.ws_stream;
    debug!(peer = %conn.remote_addr, reason, "turning client away");
    close_rejected(&mut ws, closed, reason).await;
}

async fn close_rejected(
    ws: &mut WebSocketStream<TcpStream>,
    closed: Option<ClosedInfo>,
    reason: &str,
) {
    if let Some(info) = closed {
        if let Ok(frame) = encode_server(&ServerFrame::SessionClosed(info)) {
            let _ = ws.send(Message::Binary(frame)).await;
        }
    }
    let _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::Again,
            reason: reason.to_string().into(),
        }))
        .await;
}

async fn read_loop(
    mut stream: WsStream,
    handle: &BroadcasterHandle,
    client_id: ClientId,
    input: &mpsc::Sender<Bytes>,
    control: &mpsc::Sender<Message>,
    peer: &str,
    timeout: Duration,
) {
    loop {
        let msg = match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => {
                warn!(peer = %peer, client_id, ?timeout, "client timed out");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(peer = %peer, client_id, error = %e, "WebSocket receive failed");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let frame = match msg {
            Message::Binary(data) if data.len() > MAX_WS_FRAME_SIZE => {
                warn!(peer = %peer, client_id, bytes = data.len(), "dropping oversized frame");
                continue;
            }
            Message::Text(text) if text.len() > MAX_WS_FRAME_SIZE => {
                warn!(peer = %peer, client_id, bytes = text.len(), "dropping oversized frame");
                continue;
            }
            Message::Binary(data) => decode_client(&data),
            Message::Text(text) => decode_client_text(&text),
            Message::Close(_) => return,
            // Protocol-level ping/pong is answered by tungstenite.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        let sent = match frame {
            // Waits while the PTY writer is backed up, pausing only this client.
            Ok(ClientFrame::Data(data)) => input
                .send(data)
                .await
                .map_err(|_| SipError::SessionEnded),
            Ok(ClientFrame::Resize(size)) => handle.resize(client_id, size).await,
            Ok(ClientFrame::Ping(payload)) => match encode_server(&ServerFrame::Pong(payload)) {
                Ok(pong) => control
                    .send(Message::Binary(pong))
                    .await
                    .map_err(|_| SipError::Channel("client writer gone".into())),
                Err(e) => Err(e),
            },
            Ok(ClientFrame::Pong(_)) => Ok(()),
            Err(e) => {
                warn!(peer = %peer, client_id, error = %e, "dropping malformed frame");
                Ok(())
            }
        };
        if let Err(e) = sent {
            debug!(peer = %peer, client_id, error = %e, "stopping client reader");
            return;
        }
    }
}

async fn write_loop(
    mut sink: WsSink,
    attachment: Attachment,
    mut control: mpsc::Receiver<Message>,
    ping_interval: Duration,
) -> SipResult<()> {
    let Attachment {
        client_id,
        mut output,
        mut state,
        ..
    } = attachment;
    let start = tokio::time::Instant::now() + ping_interval;
    let mut ping = tokio::time::interval_at(start, ping_interval);

    loop {
        tokio::select! {
            Some(msg) = control.recv() => send(&mut sink, msg).await?,
            chunk = output.recv() => match chunk {
                Some(data) => send_data(&mut sink, data).await?,
                None => {
                    // The broadcaster released our queue: session over or we fell behind.
                    return match terminal_info(&state) {
                        Some(info) => close_session(&mut sink, info).await,
                        None => {
                            debug!(client_id, "output queue released, closing slow consumer");
                            close(&mut sink, CloseCode::Again, "slow consumer").await
                        }
                    };
                }
            },
            changed = state.changed() => {
                let info = match changed {
                    Ok(()) => terminal_info(&state),
                    Err(_) => Some(terminal_info(&state).unwrap_or_else(|| {
                        ClosedInfo::new(CloseReason::Failed, None).with_message("session dropped")
                    })),
                };
                if let Some(info) = info {
                    while let Ok(data) = output.try_recv() {
                        send_data(&mut sink, data).await?;
                    }
                    return close_session(&mut sink, info).await;
                }
            }
            _ = ping.tick() => send(&mut sink, Message::Ping(Vec::new())).await?,
        }
    }
}

fn terminal_info(state: &watch::Receiver<SessionState>) -> Option<ClosedInfo> {
    state.borrow().closed_info().cloned()
}

async fn send(sink: &mut WsSink, msg: Message) -> SipResult<()> {
    sink.send(msg)
        .await
        .map_err(|e| SipError::Transport(format!("WS send failed: {e}")))
}

async fn send_data(sink: &mut WsSink, data: Bytes) -> SipResult<()> {
    let frame = encode_server(&ServerFrame::Data(data))?;
    send(sink, Message::Binary(frame)).await
}

async fn close_session(sink: &mut WsSink, info: ClosedInfo) -> SipResult<()> {
    let reason = info.reason;
    let frame = encode_server(&ServerFrame::SessionClosed(info))?;
    send(sink, Message::Binary(frame)).await?;
    close(sink, CloseCode::Normal, &format!("session {reason}")).await
}

async fn close(sink: &mut WsSink, code: CloseCode, reason: &str) -> SipResult<()> {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    send(sink, Message::Close(Some(frame))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::FakePty;
    use crate::session::{BroadcasterConfig, SessionBroadcaster};
    use sip_core::{decode_server, encode_client, WindowSize};
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    async fn listen() -> (SocketAddr, mpsc::Receiver<WebSocketConnection>, CancellationToken) {
        let listener = bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let rx = start_listener(listener, "/ws".into(), cancel.clone());
        (addr, rx, cancel)
    }

    async fn connected(
        settings: ClientSettings,
    ) -> (std::sync::Arc<FakePty>, BroadcasterHandle, Client, CancellationToken) {
        let (addr, mut conns, cancel) = listen().await;
        let pty = FakePty::new();
        let (handle, _join) =
            SessionBroadcaster::spawn(pty.clone(), BroadcasterConfig::default()).unwrap();

        let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let conn = tokio::time::timeout(WAIT, conns.recv()).await.unwrap().unwrap();
        let h = handle.clone();
        tokio::spawn(async move {
            let _ = serve_client(conn, h, settings).await;
        });
        (pty, handle, client, cancel)
    }

    /// Next application frame, skipping protocol-level traffic.
    async fn next_frame(client: &mut Client) -> Option<ServerFrame> {
        loop {
            let msg = tokio::time::timeout(WAIT, client.next()).await.expect("no frame");
            match msg {
                Some(Ok(Message::Binary(data))) => return Some(decode_server(&data).unwrap()),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                _ => return None,
            }
        }
    }

    async fn wait_written(pty: &FakePty, expected: &[u8]) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while pty.written() != expected {
            assert!(tokio::time::Instant::now() < deadline, "input never reached the PTY");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn unknown_path_is_rejected() {
        let (addr, _conns, cancel) = listen().await;
        assert!(connect_async(format!("ws://{addr}/nope")).await.is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn output_input_and_resize_are_bridged() {
        let (pty, handle, mut client, _cancel) = connected(ClientSettings::default()).await;

        pty.emit(b"prompt$ ");
        assert_eq!(
            next_frame(&mut client).await,
            Some(ServerFrame::Data(Bytes::from_static(b"prompt$ ")))
        );

        let input = encode_client(&ClientFrame::Data(Bytes::from_static(b"ls\r")));
        client.send(Message::Binary(input)).await.unwrap();
        client
            .send(Message::Text(r#"{"type":"input","data":"pwd\r"}"#.into()))
            .await
            .unwrap();
        wait_written(&pty, b"ls\rpwd\r").await;

        let resize = encode_client(&ClientFrame::Resize(WindowSize::new(40, 120)));
        client.send(Message::Binary(resize)).await.unwrap();
        client
            .send(Message::Binary(encode_client(&ClientFrame::Ping(Bytes::from_static(b"k")))))
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut client).await,
            Some(ServerFrame::Pong(Bytes::from_static(b"k")))
        );
        assert_eq!(handle.inspect().await.unwrap().window_size, WindowSize::new(40, 120));
    }

    #[tokio::test]
    async fn malformed_frames_do_not_close_the_connection() {
        let (pty, _handle, mut client, _cancel) = connected(ClientSettings::default()).await;

        client.send(Message::Binary(vec![0x09, 1, 2])).await.unwrap();
        client.send(Message::Binary(vec![0x01, 0, 0])).await.unwrap();
        client.send(Message::Binary(Vec::new())).await.unwrap();
        client.send(Message::Text("not json".into())).await.unwrap();
        client
            .send(Message::Binary(vec![0u8; MAX_WS_FRAME_SIZE + 2]))
            .await
            .unwrap();
        client.send(Message::Binary(vec![0x00, b'o', b'k'])).await.unwrap();

        wait_written(&pty, b"ok").await;
        pty.emit(b"still here");
        assert_eq!(
            next_frame(&mut client).await,
            Some(ServerFrame::Data(Bytes::from_static(b"still here")))
        );
    }

    #[tokio::test]
    async fn session_end_follows_queued_output() {
        let (pty, _handle, mut client, _cancel) = connected(ClientSettings::default()).await;

        pty.emit(b"last words");
        pty.exit(7);

        assert_eq!(
            next_frame(&mut client).await,
            Some(ServerFrame::Data(Bytes::from_static(b"last words")))
        );
        assert_eq!(
            next_frame(&mut client).await,
            Some(ServerFrame::SessionClosed(ClosedInfo::new(CloseReason::Exited, Some(7))))
        );
    }

    #[tokio::test]
    async fn late_client_is_told_the_session_is_over() {
        let (pty, handle, mut first, _cancel) = connected(ClientSettings::default()).await;
        pty.exit(0);
        handle.closed().await;
        assert_eq!(
            next_frame(&mut first).await,
            Some(ServerFrame::SessionClosed(ClosedInfo::new(CloseReason::Exited, Some(0))))
        );

        let (addr, mut conns, _cancel) = listen().await;
        let (mut late, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let conn = tokio::time::timeout(WAIT, conns.recv()).await.unwrap().unwrap();
        let served = tokio::spawn(serve_client(conn, handle, ClientSettings::default()));

        assert_eq!(
            next_frame(&mut late).await,
            Some(ServerFrame::SessionClosed(ClosedInfo::new(CloseReason::Exited, Some(0))))
        );
        assert!(matches!(served.await.unwrap(), Err(SipError::SessionEnded)));
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let settings = ClientSettings {
            ping_interval: Duration::from_secs(60),
            timeout: Duration::from_millis(100),
        };
        let (_pty, handle, _client, _cancel) = connected(settings).await;

        let deadline = tokio::time::Instant::now() + WAIT;
        let mut seen = false;
        loop {
            let clients = handle.inspect().await.unwrap().clients.len();
            seen |= clients == 1;
            if seen && clients == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "client was never dropped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
