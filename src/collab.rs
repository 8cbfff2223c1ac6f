//! Collaborator traits fixing the boundary between the core protocol engine
//! and the components it is handed by its caller but does not own: the UDP
//! socket I/O loop, the outgoing-message allocator/pool, and the time
//! source.
//!
//! The engine never constructs a socket, allocates an [`OutgoingMessage`]
//! pool, or reads the wall clock directly - it only calls through these
//! traits, so tests can substitute virtual time and an in-memory packet
//! sink.

use {
    crate::message::OutgoingMessage,
    std::{net::SocketAddr, time::Instant},
};

/// Represents the UDP socket I/O loop: the thing that actually writes bytes
/// onto the network.
pub trait PacketSink {
    /// Writes `payload` to `to`.
    ///
    /// # Errors
    ///
    /// Errors with [`ConnectionReset`] if the OS indicates the peer has
    /// reset the connection (e.g. an ICMP port-unreachable on a connected
    /// UDP socket). This triggers an immediate local disconnect.
    fn send_packet(&mut self, payload: &[u8], to: SocketAddr) -> Result<(), ConnectionReset>;
}

/// The OS indicated that the remote peer is unreachable or has reset the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("connection reset")]
pub struct ConnectionReset;

/// Represents the peer-level allocator/pool that [`OutgoingMessage`] buffers
/// are recycled back into once every [`crate::message::SendingRecord`]
/// referencing them has finished.
pub trait MessagePool {
    /// Returns a message's buffer to the pool for reuse.
    ///
    /// Called exactly once per outgoing message, when its unfinished-sendings
    /// count reaches zero (see [`crate::message::SharedMessage::finish_one`]).
    fn recycle(&mut self, msg: OutgoingMessage);
}

/// Represents the time source used for wall-clock reads.
///
/// Injected so tests can drive virtual time instead of real
/// [`Instant::now`].
pub trait Clock {
    /// Gets the current time.
    fn now(&self) -> Instant;
}

/// A [`Clock`] backed by the real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
