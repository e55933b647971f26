//! Connection pumps: one task for reading, one for writing and keepalive.

pub(crate) mod read;
pub(crate) mod write;
