//! Wire protocol types for relay/agent communication.
//!
//! Every frame on the persistent connection is a JSON text message of the
//! form `{"type": <tag>, "payload": {...}}`, decoded at the boundary into
//! the closed [`Envelope`] sum type.

pub mod constants;
pub mod envelope;
pub mod messages;

pub use constants::MessageType;
pub use envelope::{Envelope, EnvelopeError};
