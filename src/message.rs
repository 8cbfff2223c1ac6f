//! Wire representation of a single message: its [`MessageType`], header, and
//! the bookkeeping needed to track a transmission until it is acknowledged or
//! recycled.
//!
//! See [`MessageHeader`] for the on-wire layout and [`SendingRecord`] for how
//! a single transmission attempt is tracked.

use {
    crate::{
        frag::FragmentPosition,
        lane::{ChannelIndex, DeliveryMethod},
        library::LibraryMessageType,
        seq::Seq,
    },
    core::{cell::Cell, convert::Infallible, fmt},
    derive_more::{Display, Error},
    octs::{BufTooShortOr, Bytes, Decode, Encode, FixedEncodeLen, Read, Write},
    std::{rc::Rc, time::Instant},
};

/// Largest `channels_per_delivery_method` configuration value that still
/// allows every `(method, channel)` pair plus [`MessageType::LIBRARY`] to fit
/// into a single `u8` wire value.
///
/// `NUM_DELIVERY_METHODS * MAX_CHANNELS_PER_METHOD + 1 <= 256`.
pub const MAX_CHANNELS_PER_METHOD: u8 = 51;

/// Single-byte wire encoding of "which delivery method, and which channel
/// within that method, does this message belong to".
///
/// Value `0` is reserved for [`MessageType::LIBRARY`]; values `1..` are
/// computed as `1 + method_index * channels_per_method + channel`, so the
/// mapping depends on the connection's configured `channels_per_method` (see
/// [`crate::config::Config::channels_per_delivery_method`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct MessageType(pub u8);

impl MessageType {
    /// The internal-protocol message type, as opposed to an application data
    /// message.
    pub const LIBRARY: Self = Self(0);

    /// Computes the wire byte for a given delivery method and channel.
    ///
    /// Returns `None` if `channel >= channels_per_method`, or if
    /// `channels_per_method > MAX_CHANNELS_PER_METHOD`.
    #[must_use]
    pub fn user(method: DeliveryMethod, channel: ChannelIndex, channels_per_method: u8) -> Option<Self> {
        if channel.0 >= channels_per_method || channels_per_method > MAX_CHANNELS_PER_METHOD {
            return None;
        }
        let method_index = method_index(method);
        let raw = 1u16 + u16::from(method_index) * u16::from(channels_per_method) + u16::from(channel.0);
        u8::try_from(raw).ok().map(Self)
    }

    /// Decodes this wire byte back into a [`Kind`], given the
    /// `channels_per_method` the connection was configured with.
    #[must_use]
    pub fn decode_kind(self, channels_per_method: u8) -> Option<Kind> {
        if self == Self::LIBRARY {
            return Some(Kind::Library);
        }
        let offset = u16::from(self.0) - 1;
        let channels_per_method16 = u16::from(channels_per_method);
        let method_index = u8::try_from(offset / channels_per_method16).ok()?;
        let channel = u8::try_from(offset % channels_per_method16).ok()?;
        let method = method_from_index(method_index)?;
        Some(Kind::User(method, ChannelIndex(channel)))
    }
}

const fn method_index(method: DeliveryMethod) -> u8 {
    match method {
        DeliveryMethod::Unreliable => 0,
        DeliveryMethod::UnreliableSequenced => 1,
        DeliveryMethod::ReliableUnordered => 2,
        DeliveryMethod::ReliableSequenced => 3,
        DeliveryMethod::ReliableOrdered => 4,
    }
}

const fn method_from_index(index: u8) -> Option<DeliveryMethod> {
    match index {
        0 => Some(DeliveryMethod::Unreliable),
        1 => Some(DeliveryMethod::UnreliableSequenced),
        2 => Some(DeliveryMethod::ReliableUnordered),
        3 => Some(DeliveryMethod::ReliableSequenced),
        4 => Some(DeliveryMethod::ReliableOrdered),
        _ => None,
    }
}

/// Decoded meaning of a [`MessageType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// An internal protocol message (see [`crate::library::LibraryMessage`]).
    Library,
    /// An application data message sent on a specific channel.
    User(DeliveryMethod, ChannelIndex),
}

impl FixedEncodeLen for MessageType {
    const ENCODE_LEN: usize = u8::ENCODE_LEN;
}

impl Encode for MessageType {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for MessageType {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

/// Header written before every message's payload in a packet.
///
/// Followed by a single `has_fragment: bool` byte (encoded as `u8`), and if
/// that byte is `1`, a [`FragmentPosition`] before the payload itself.
///
/// This rewrite does not steal a bit out of `len` for the fragmentation flag
/// (as the original source's header apparently did) - it is its own byte,
/// which costs one extra byte per message but keeps both fields full-range
/// and the layout trivial to reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// What this message is (library, or which user channel).
    pub ty: MessageType,
    /// Sequence number of this message, scoped to `ty`'s channel.
    pub seq: Seq,
    /// Byte length of this message's payload (not including this header or
    /// any fragment header that follows it).
    pub len: u16,
}

impl FixedEncodeLen for MessageHeader {
    const ENCODE_LEN: usize = MessageType::ENCODE_LEN + Seq::ENCODE_LEN + u16::ENCODE_LEN;
}

impl Encode for MessageHeader {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.ty)?;
        dst.write(&self.seq)?;
        dst.write(&self.len)?;
        Ok(())
    }
}

impl Decode for MessageHeader {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            ty: src.read()?,
            seq: src.read()?,
            len: src.read()?,
        })
    }
}

/// Maximum number of header bytes a single message can cost on the wire:
/// [`MessageHeader`], the fragment flag byte, and a [`FragmentPosition`].
pub const MAX_MESSAGE_OVERHEAD: usize = MessageHeader::ENCODE_LEN + 1 + FragmentPosition::ENCODE_LEN;

/// A message queued for sending, owned by the connection's message pool until
/// every [`SendingRecord`] referencing it has finished (see
/// [`SharedMessage::finish_one`]).
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Payload bytes. For a library message this is the encoded library
    /// payload; for a user message this is the application's payload as-is.
    pub payload: Bytes,
    /// `Some` if this is a library message, identifying which one.
    pub lib_type: Option<LibraryMessageType>,
}

struct SharedMessageInner {
    msg: OutgoingMessage,
    remaining: Cell<usize>,
}

/// Reference-counted handle to an [`OutgoingMessage`] shared between the
/// [`SendingRecord`]s of its fragments (or the single `SendingRecord` of an
/// unfragmented message).
///
/// Tracks "number of unfinished sendings" as described in the data model:
/// once the last fragment's `SendingRecord` finishes (is acknowledged, for a
/// reliable message, or is transmitted once, for an unreliable one), the
/// message is handed back to the [`crate::collab::MessagePool`] exactly once.
#[derive(Clone)]
pub struct SharedMessage(Rc<SharedMessageInner>);

impl fmt::Debug for SharedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SharedMessage")
            .field("lib_type", &self.0.msg.lib_type)
            .field("len", &self.0.msg.payload.len())
            .field("remaining", &self.0.remaining.get())
            .finish()
    }
}

impl SharedMessage {
    /// Wraps a message, declaring how many `SendingRecord`s will reference it
    /// (1 for an unfragmented message, or the fragment count otherwise).
    #[must_use]
    pub fn new(msg: OutgoingMessage, num_sendings: usize) -> Self {
        assert!(num_sendings > 0);
        Self(Rc::new(SharedMessageInner {
            msg,
            remaining: Cell::new(num_sendings),
        }))
    }

    /// Gets the payload bytes of the underlying message.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.0.msg.payload
    }

    /// Gets the library subtype of the underlying message, if it is one.
    #[must_use]
    pub fn lib_type(&self) -> Option<LibraryMessageType> {
        self.0.msg.lib_type
    }

    /// Marks one of this message's sendings as finished (sent, for an
    /// unreliable message; acknowledged, for a reliable one).
    ///
    /// Once every sending has finished, the message is cloned out and handed
    /// to `pool.recycle`. Cloning a [`Bytes`] buffer is a cheap refcount
    /// bump, so this does not require unwrapping the shared `Rc`.
    pub fn finish_one(&self, pool: &mut impl crate::collab::MessagePool) {
        let remaining = self.0.remaining.get();
        debug_assert!(remaining > 0, "finished more sendings than were declared");
        let remaining = remaining.saturating_sub(1);
        self.0.remaining.set(remaining);
        if remaining == 0 {
            pool.recycle(OutgoingMessage {
                payload: self.0.msg.payload.clone(),
                lib_type: self.0.msg.lib_type,
            });
        }
    }
}

/// A single in-flight transmission of a (possibly fragmented) message.
///
/// One [`OutgoingMessage`] produces one `SendingRecord` if sent whole, or one
/// per fragment if split by [`crate::frag::split`].
#[derive(Debug, Clone)]
pub struct SendingRecord {
    id: u64,
    /// The message being sent. Shared between all fragments of one message.
    pub msg: SharedMessage,
    /// Wire message type.
    pub ty: MessageType,
    /// Sequence number assigned to this transmission by
    /// [`crate::channel::ChannelState::stamp_outgoing`].
    pub seq: Seq,
    /// `Some` if this record is one fragment of a larger message.
    pub frag: Option<FragmentPosition>,
    /// Number of times this exact record has been written to the wire.
    pub num_sends: u32,
    /// Deadline at which this record should be resent, if it is still
    /// unacknowledged by then. `None` until the first send.
    pub next_resend: Option<Instant>,
}

impl PartialEq for SendingRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SendingRecord {}

impl SendingRecord {
    /// Creates a new record for a not-yet-sent transmission.
    #[must_use]
    pub fn new(id: u64, msg: SharedMessage, ty: MessageType, seq: Seq, frag: Option<FragmentPosition>) -> Self {
        Self {
            id,
            msg,
            ty,
            seq,
            frag,
            num_sends: 0,
            next_resend: None,
        }
    }

    /// Identity of this record, used for equality and as an unacked-sends
    /// map disambiguator when the same `(ty, seq)` is reused after wraparound.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Records that this was just written to the wire, and computes the next
    /// resend deadline from the connection's RTT estimate and an exponential
    /// backoff multiplier based on how many times this has been sent before.
    pub fn set_next_resend(&mut self, now: Instant, rtt: &crate::rtt::RttEstimator) {
        self.num_sends = self.num_sends.saturating_add(1);
        let backoff = 1u32 << self.num_sends.min(6);
        self.next_resend = Some(now + rtt.pto() * backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips_all_channels() {
        const CHANNELS: u8 = 32;
        for method in [
            DeliveryMethod::Unreliable,
            DeliveryMethod::UnreliableSequenced,
            DeliveryMethod::ReliableUnordered,
            DeliveryMethod::ReliableSequenced,
            DeliveryMethod::ReliableOrdered,
        ] {
            for channel in 0..CHANNELS {
                let ty = MessageType::user(method, ChannelIndex(channel), CHANNELS).unwrap();
                assert_eq!(Some(Kind::User(method, ChannelIndex(channel))), ty.decode_kind(CHANNELS));
            }
        }
    }

    #[test]
    fn library_is_zero() {
        assert_eq!(MessageType(0), MessageType::LIBRARY);
        assert_eq!(Some(Kind::Library), MessageType::LIBRARY.decode_kind(32));
    }

    #[test]
    fn out_of_range_channel_rejected() {
        assert!(MessageType::user(DeliveryMethod::Unreliable, ChannelIndex(32), 32).is_none());
    }

    #[test]
    fn max_channels_per_method_fits_in_u8() {
        assert!(MessageType::user(
            DeliveryMethod::ReliableOrdered,
            ChannelIndex(MAX_CHANNELS_PER_METHOD - 1),
            MAX_CHANNELS_PER_METHOD
        )
        .is_some());
    }
}
