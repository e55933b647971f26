//! Agent connection management: read/write pumps, keepalive, send buffering.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use pullwire_protocol::constants::{WS_PING_PERIOD, WS_PONG_WAIT};
use pullwire_protocol::envelope::Envelope;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle for sending envelopes to a connected agent.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Creates a sender and the receiving end its write pump drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queues an envelope as a JSON text frame.
    ///
    /// Returns `Err` if the buffer is full or the agent disconnected.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), SendError> {
        let json = envelope.encode().map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!(msg_type = %envelope.msg_type(), "send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Identity of one live agent connection.
///
/// Two handles are equal only if they refer to the same underlying
/// connection, regardless of which client id was registered over it.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    peer_addr: String,
    sender: Sender,
}

impl ConnectionHandle {
    pub fn new(peer_addr: impl Into<String>, sender: Sender) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr: peer_addr.into(),
            sender,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Runs the read and write pumps for an accepted agent WebSocket.
///
/// Returns the connection's handle. The pumps run as background tasks and
/// stop when the socket closes or `server_cancel` fires; the handler's
/// `on_disconnected` runs exactly once afterwards.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    peer_addr: String,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> ConnectionHandle
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (sender, rx) = Sender::channel(SEND_BUFFER_SIZE);
    let conn = ConnectionHandle::new(peer_addr, sender);
    let cancel = server_cancel.child_token();

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_conn = conn.clone();
    tokio::spawn(async move {
        read_pump(ws_stream, &read_conn, &handler, cancel.clone()).await;
        // When the read pump exits, stop the write pump too.
        cancel.cancel();
        handler.on_disconnected(read_conn.clone()).await;
        tracing::info!(conn = read_conn.id(), peer = %read_conn.peer_addr(), "agent disconnected");
    });

    conn
}

/// Write pump: drains the send channel in order. A ping is sent only when
/// nothing else has gone out for [`WS_PING_PERIOD`].
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let keepalive = tokio::time::sleep(WS_PING_PERIOD);
    tokio::pin!(keepalive);

    let stopped = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break "cancelled",
            _ = &mut keepalive => WsMessage::Ping(Vec::new().into()),
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break "handle dropped",
            },
        };
        if let Err(e) = sink.send(frame).await {
            tracing::warn!("write pump send error: {e}");
            break "send failed";
        }
        keepalive
            .as_mut()
            .reset(tokio::time::Instant::now() + WS_PING_PERIOD);
    };
    tracing::debug!(stopped, "write pump exiting");

    if let Err(e) = sink.close().await {
        tracing::debug!("close frame not sent: {e}");
    }
}

/// Read pump: reads WS frames and dispatches decoded envelopes.
async fn read_pump<S, H>(mut stream: S, conn: &ConnectionHandle, handler: &Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    // Any inbound frame proves the peer is alive; chunk streams keep the
    // connection busy long after the last pong.
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = &mut pong_deadline => {
                tracing::warn!(conn = conn.id(), "read deadline exceeded, closing connection");
                break;
            }

            frame = stream.next() => {
                pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                match frame {
                    Some(Ok(WsMessage::Text(text))) => dispatch_text(handler, conn, &text).await,
                    Some(Ok(WsMessage::Binary(data))) => {
                        tracing::warn!(conn = conn.id(), len = data.len(), "ignoring binary frame");
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Ping(data))) => {
                        if conn.sender().tx.try_send(WsMessage::Pong(data)).is_err() {
                            tracing::debug!(conn = conn.id(), "pong dropped, send buffer full");
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        tracing::debug!(conn = conn.id(), "received close frame");
                        break;
                    }
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::error!(conn = conn.id(), "read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Decodes a text frame and hands it to the handler. Malformed frames are
/// logged and dropped; the connection stays open.
async fn dispatch_text<H: Handler>(handler: &Arc<H>, conn: &ConnectionHandle, text: &str) {
    match Envelope::decode(text) {
        Ok(envelope) => handler.on_envelope(conn.clone(), envelope).await,
        Err(e) => tracing::warn!(conn = conn.id(), "discarding malformed envelope: {e}"),
    }
}
