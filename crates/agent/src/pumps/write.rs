//! WebSocket write pump: serialises outbound frames, reports flushes and
//! keeps an idle connection alive.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use pullwire_protocol::constants::WS_PING_PERIOD;

use crate::outbound::OutboundFrame;

/// Writes frames to the WebSocket in queue order.
///
/// A frame's flush notifier fires only after the sink has written and
/// flushed it. Frames still queued when the pump stops are dropped, which
/// their waiters observe as a closed connection. A ping goes out only after
/// [`WS_PING_PERIOD`] without any other write.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let idle = tokio::time::sleep(WS_PING_PERIOD);
    tokio::pin!(idle);

    loop {
        let (message, flushed) = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut idle => (tungstenite::Message::Ping(Vec::new().into()), None),
            frame = write_rx.recv() => match frame {
                Some(OutboundFrame { message, flushed }) => (message, flushed),
                None => break,
            },
        };

        let result = write.send(message).await.map_err(|e| e.to_string());
        if let Some(notifier) = flushed {
            notifier.notify(result.clone());
        }
        if let Err(e) = result {
            error!("WebSocket write error: {e}");
            break;
        }
        idle.as_mut().reset(Instant::now() + WS_PING_PERIOD);
    }

    cancel.cancel();
    if let Err(e) = write.send(tungstenite::Message::Close(None)).await {
        debug!("close frame not sent: {e}");
    }
}
