//! WebSocket read pump: decodes relay frames and hands them to the dispatcher.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use pullwire_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use pullwire_protocol::envelope::Envelope;

use crate::dispatch::Transfers;
use crate::outbound::Outbound;

/// Reads frames from the relay until the connection ends.
///
/// Any inbound frame resets the read deadline; silence for
/// [`WS_PONG_WAIT`] is treated as a dead connection. Cancels `cancel` on
/// exit so the sibling pumps stop too.
pub(crate) async fn read_pump<S>(
    mut read: S,
    transfers: Arc<Transfers>,
    outbound: Outbound,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("read deadline exceeded, closing connection");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &transfers).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = outbound.send_raw(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {} // Binary
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
}

async fn handle_text_message(text: &str, transfers: &Arc<Transfers>) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    match Envelope::decode(text) {
        Ok(envelope) => {
            trace!(msg_type = envelope.msg_type().as_str(), "received message");
            transfers.dispatch(envelope).await;
        }
        Err(e) => warn!("dropping malformed frame: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use pullwire_protocol::messages::DownloadRequestPayload;
    use pullwire_transfer::FlowConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    fn transfers(outbound: &Outbound) -> Arc<Transfers> {
        Transfers::new(
            "c1".into(),
            PathBuf::from("/missing/source.bin"),
            FlowConfig::default(),
            outbound.clone(),
        )
    }

    #[tokio::test]
    async fn read_pump_stops_on_stream_end() {
        let (outbound, _rx) = Outbound::channel(16);
        let cancel = CancellationToken::new();
        let read = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();

        tokio::time::timeout(
            Duration::from_secs(2),
            read_pump(read, transfers(&outbound), outbound, cancel.clone()),
        )
        .await
        .expect("should stop");
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn ping_answered_with_pong() {
        let (outbound, mut rx) = Outbound::channel(16);
        let cancel = CancellationToken::new();
        let read = stream::iter(vec![Ok(tungstenite::Message::Ping(vec![1, 2].into()))]);

        read_pump(read, transfers(&outbound), outbound, cancel).await;

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame.message, tungstenite::Message::Pong(ref d) if d[..] == [1u8, 2]));
    }

    #[tokio::test]
    async fn malformed_frames_skipped_and_requests_dispatched() {
        let (outbound, mut rx) = Outbound::channel(16);
        let cancel = CancellationToken::new();
        let request = Envelope::DownloadRequest(DownloadRequestPayload {
            session_id: "s1".into(),
        });
        let read = stream::iter(vec![
            Ok(tungstenite::Message::Text("garbage".into())),
            Ok(tungstenite::Message::Text(r#"{"type":"warp","payload":{}}"#.into())),
            Ok(tungstenite::Message::Text(request.encode().unwrap().into())),
        ]);

        read_pump(read, transfers(&outbound), outbound, cancel).await;

        // The source file does not exist, so the request is answered with an error.
        let frame = rx.recv().await.unwrap();
        let tungstenite::Message::Text(text) = &frame.message else {
            panic!("expected text frame");
        };
        assert_eq!(
            Envelope::decode(text).unwrap(),
            Envelope::error(Some("s1"), "File not found")
        );
    }
}
