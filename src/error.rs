//! Errors surfaced synchronously to application threads.
//!
//! Network-thread-internal errors (malformed inbound data, unknown library
//! types) are not part of this module - they are logged via the `log` crate
//! and never propagate to the caller, per the error taxonomy's "transient
//! remote error" and "dispatch exception" categories.

use crate::lane::{ChannelIndex, DeliveryMethod};

/// A programmer error returned from [`crate::conn::Connection::send_message`]
/// or [`crate::conn::Connection::send_library`].
///
/// These are "fail fast with a descriptive failure" per the error taxonomy:
/// a library must not decide to abort its caller's process, so instead of
/// panicking, the error is made impossible to silently ignore via
/// `#[must_use]` on the `Result` it is returned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum SendError {
    /// `channel` is out of range for the configured
    /// `channels_per_delivery_method`.
    #[display("channel {} is out of range for {method:?} (max {max})", channel.0)]
    ChannelOutOfRange {
        /// Delivery method the message was sent with.
        method: DeliveryMethod,
        /// Channel index requested.
        channel: ChannelIndex,
        /// Maximum valid channel index (exclusive).
        max: u8,
    },
    /// The connection is not in a state that accepts new sends (e.g.
    /// disconnecting or disconnected).
    #[display("connection is not established")]
    NotConnected,
    /// The message is too large to ever be sent, even after fragmentation
    /// (it would require more than [`u16::MAX`] fragments).
    #[display("message too big to send")]
    MessageTooBig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_non_empty() {
        let err = SendError::ChannelOutOfRange {
            method: DeliveryMethod::ReliableOrdered,
            channel: ChannelIndex(99),
            max: 32,
        };
        assert!(!err.to_string().is_empty());
    }
}
