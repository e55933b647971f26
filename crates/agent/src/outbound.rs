use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use pullwire_protocol::envelope::Envelope;
use pullwire_transfer::{EnvelopeSink, FlushAck, FlushNotifier, SinkFuture, TransferError};

/// One frame queued for the write pump.
pub(crate) struct OutboundFrame {
    pub(crate) message: tungstenite::Message,
    /// Resolved once the frame has been written and flushed.
    pub(crate) flushed: Option<FlushNotifier>,
}

/// Ordered outbound queue of one relay connection.
///
/// Cloneable; every clone feeds the same write pump.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<OutboundFrame>,
}

impl Outbound {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queues a control frame (ping/pong/close) without flush tracking.
    pub(crate) async fn send_raw(&self, message: tungstenite::Message) -> Result<(), TransferError> {
        self.tx
            .send(OutboundFrame {
                message,
                flushed: None,
            })
            .await
            .map_err(|_| TransferError::ConnectionClosed)
    }

    /// Returns `true` while the write pump is running.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl EnvelopeSink for Outbound {
    fn enqueue(&self, envelope: Envelope) -> SinkFuture<'_> {
        Box::pin(async move {
            let json = envelope.encode()?;
            let (notifier, ack) = FlushAck::channel();
            self.tx
                .send(OutboundFrame {
                    message: tungstenite::Message::Text(json.into()),
                    flushed: Some(notifier),
                })
                .await
                .map_err(|_| TransferError::ConnectionClosed)?;
            Ok(ack)
        })
    }
}
