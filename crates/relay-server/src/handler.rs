//! Handler trait for envelopes arriving on agent connections.

use std::future::Future;
use std::pin::Pin;

use pullwire_protocol::envelope::Envelope;

use crate::connection::ConnectionHandle;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Receives decoded envelopes from the connection pumps.
///
/// Envelopes of one connection are delivered in arrival order, one at a
/// time: the read pump awaits each call before reading the next frame.
pub trait Handler: Send + Sync + 'static {
    /// Called for every well-formed envelope.
    fn on_envelope(&self, conn: ConnectionHandle, envelope: Envelope) -> HandlerFuture<'_>;

    /// Called once after the connection has closed or failed.
    fn on_disconnected(&self, conn: ConnectionHandle) -> HandlerFuture<'_>;
}
