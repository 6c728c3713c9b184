use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{
    connect_async, tungstenite, tungstenite::Message as WsMessage, MaybeTlsStream,
    WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::CallError;

use super::message::SignalMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport-level events published on the session bus. Two logical
/// consumers (call engine, presence) subscribe to the same connection via
/// message dispatch; the connection itself is owned by the session scope.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// The socket is open (initial connect or a successful reconnect).
    Open,
    /// The socket dropped; the transport keeps retrying until closed.
    Closed,
    Message(SignalMessage),
}

/// Cheap clonable sender half of the transport.
#[derive(Clone)]
pub struct SignalingHandle {
    outbound: mpsc::UnboundedSender<SignalMessage>,
    open: Arc<AtomicBool>,
}

impl SignalingHandle {
    /// Best-effort, at-most-once send. A logged no-op while the socket is
    /// down; messages are never queued for a future connection.
    pub fn send(&self, msg: SignalMessage) {
        if !self.open.load(Ordering::Relaxed) {
            warn!("signaling transport not open, dropping outbound message");
            return;
        }
        if self.outbound.send(msg).is_err() {
            debug!("signaling task gone, message dropped");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/// One persistent relay connection per session. Established independently of
/// call activity so `incoming_call` can arrive while idle, and torn down only
/// by `close()` (or drop), not on call end.
pub struct SignalingTransport {
    handle: SignalingHandle,
    events: broadcast::Sender<SignalEvent>,
    close_tx: watch::Sender<bool>,
}

impl SignalingTransport {
    /// Connect to the relay. Only the initial attempt can fail the session:
    /// HTTP 401/403 is an authentication error, anything else a transport
    /// error. Later drops are retried silently at a fixed delay.
    pub async fn connect(cfg: &ClientConfig) -> Result<Self, CallError> {
        let url = cfg.signaling_url();
        let (ws, _) = connect_async(&url).await.map_err(classify_connect_error)?;
        info!(session = %cfg.session_id, "signaling transport connected");

        let (events, _) = broadcast::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(run_connection(
            ws,
            url,
            cfg.reconnect_delay,
            outbound_rx,
            open.clone(),
            events.clone(),
            close_rx,
        ));

        Ok(Self {
            handle: SignalingHandle { outbound: outbound_tx, open },
            events,
            close_tx,
        })
    }

    pub fn handle(&self) -> SignalingHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    /// Tear the connection down for good. Stops any reconnect loop.
    pub fn close(&self) {
        self.handle.open.store(false, Ordering::Relaxed);
        let _ = self.close_tx.send(true);
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify_connect_error(err: tungstenite::Error) -> CallError {
    match &err {
        tungstenite::Error::Http(resp)
            if matches!(resp.status().as_u16(), 401 | 403) =>
        {
            CallError::Auth(format!("relay rejected token: {}", resp.status()))
        }
        _ => CallError::Transport(err.to_string()),
    }
}

async fn run_connection(
    mut ws: WsStream,
    url: String,
    reconnect_delay: Duration,
    mut outbound_rx: mpsc::UnboundedReceiver<SignalMessage>,
    open: Arc<AtomicBool>,
    events: broadcast::Sender<SignalEvent>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        open.store(true, Ordering::Relaxed);
        let _ = events.send(SignalEvent::Open);

        let (mut write, mut read) = ws.split();
        loop {
            tokio::select! {
                res = close_rx.changed() => {
                    // Explicit close, or the owner went away.
                    let _ = res;
                    let _ = write.send(WsMessage::Close(None)).await;
                    open.store(false, Ordering::Relaxed);
                    let _ = events.send(SignalEvent::Closed);
                    return;
                }
                Some(msg) = outbound_rx.recv() => {
                    match msg.encode() {
                        Ok(text) => {
                            if write.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("failed to encode signaling message: {}", e),
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match SignalMessage::decode(&text) {
                                Ok(msg) => {
                                    let _ = events.send(SignalEvent::Message(msg));
                                }
                                Err(e) => {
                                    debug!("ignoring unrecognized signaling frame: {}", e);
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if write.send(WsMessage::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("signaling read error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        open.store(false, Ordering::Relaxed);
        let _ = events.send(SignalEvent::Closed);
        if *close_rx.borrow() {
            return;
        }

        // Fixed-delay reconnect, indefinitely, until explicitly closed.
        // Transient failures are logged, not surfaced.
        loop {
            tokio::select! {
                _ = close_rx.changed() => return,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
            match connect_async(&url).await {
                Ok((stream, _)) => {
                    info!("signaling transport reconnected");
                    ws = stream;
                    break;
                }
                Err(e) => debug!("signaling reconnect failed: {}", e),
            }
        }
    }
}
