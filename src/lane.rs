//! Provides guarantees on message delivery and reception.
//!
//! Packets are not guaranteed to have any guarantees on delivery or ordering -
//! that is, if you send out a packet, there is no guarantee that:
//! - the packet will be received by the peer
//! - the packet will only be received once
//! - packets are received in the same order that they were sent
//!
//! Instead, these guarantees are provided when sending out *messages* over a
//! *channel*. There may be multiple channels on a single connection, and they
//! provide guarantees on:
//! - reliability - the message is guaranteed to be received by the peer once,
//!   and only once
//! - ordering - messages sent on a specific channel are guaranteed to be
//!   received in the same order that they were sent
//!   - ordering *between* channels is *never* guaranteed
//!
//! Note that a channel provides a *minimum* guarantee of reliability and
//! ordering - if the application only ever uses one delivery method, that is
//! still represented as a channel with a single sequence number space.

use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};

/// Number of [`DeliveryMethod`] variants, i.e. the number of slices a
/// [`crate::channel::ChannelTable`] is divided into.
pub const NUM_DELIVERY_METHODS: usize = 5;

/// What guarantees a [`DeliveryMethod`] provides about message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeliveryMethod {
    /// No guarantees on *reliability* or *ordering*.
    ///
    /// Useful for fire-and-forget messages where losing a few in transit is
    /// acceptable, e.g. particle-effect spawn notifications.
    Unreliable,
    /// *Unreliable*, but only messages newer than the last-received message
    /// on this channel are ever delivered.
    ///
    /// Useful for a steady stream of state updates (e.g. player position)
    /// where a dropped update doesn't matter, but an update should never
    /// make the receiver go back in time.
    UnreliableSequenced,
    /// *Reliable*, but *unordered*: the message is guaranteed to arrive, but
    /// may arrive in any order relative to other messages on this channel.
    ///
    /// Avoids head-of-line blocking compared to [`ReliableOrdered`], at the
    /// cost of not preserving send order.
    ///
    /// [`ReliableOrdered`]: DeliveryMethod::ReliableOrdered
    ReliableUnordered,
    /// *Reliable* and *sequenced*: the message is guaranteed to eventually be
    /// acknowledged, but only the newest message is ever released to the
    /// application - like [`UnreliableSequenced`], but every message
    /// (including ones superseded before release) is still acked, so the
    /// sender's unacked-send set empties out even for stale sends.
    ///
    /// [`UnreliableSequenced`]: DeliveryMethod::UnreliableSequenced
    ReliableSequenced,
    /// *Reliable* and *ordered*: the message is guaranteed to arrive exactly
    /// once, and messages on this channel are released to the application in
    /// the exact order they were sent.
    ///
    /// The most expensive delivery method: may suffer from head-of-line
    /// blocking if an earlier message's fragments are still missing.
    ReliableOrdered,
}

impl DeliveryMethod {
    /// Gets whether this delivery method guarantees message reliability.
    #[must_use]
    pub const fn reliability(&self) -> Reliability {
        match self {
            Self::Unreliable | Self::UnreliableSequenced => Reliability::Unreliable,
            Self::ReliableUnordered | Self::ReliableSequenced | Self::ReliableOrdered => {
                Reliability::Reliable
            }
        }
    }

    /// Gets whether this delivery method only releases messages newer than
    /// the last one released (sequenced), as opposed to releasing every
    /// message that isn't a duplicate.
    #[must_use]
    pub const fn is_sequenced(&self) -> bool {
        matches!(self, Self::UnreliableSequenced | Self::ReliableSequenced)
    }

    /// Gets whether this delivery method withholds early-arriving messages
    /// until the gap before them is filled, so that release order matches
    /// send order.
    #[must_use]
    pub const fn is_ordered(&self) -> bool {
        matches!(self, Self::ReliableOrdered)
    }
}

/// Guarantee a [`DeliveryMethod`] provides about whether a message sent is
/// eventually received by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Reliability {
    /// The message may never be received by the peer, or may be received
    /// more than once.
    Unreliable,
    /// The message is guaranteed to be received by the peer exactly once.
    Reliable,
}

/// Index of a sequence channel within a [`DeliveryMethod`], on either the
/// sender or receiver side.
///
/// Each delivery method has its own array of channels
/// (`net_channels_per_delivery_method` wide, see configuration), and each
/// channel has an independent sequence-number space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelIndex(pub u8);

impl ChannelIndex {
    /// Creates a new channel index from a raw integer.
    #[must_use]
    pub const fn new(n: u8) -> Self {
        Self(n)
    }
}

impl FixedEncodeLen for ChannelIndex {
    const ENCODE_LEN: usize = u8::ENCODE_LEN;
}

impl Encode for ChannelIndex {
    type Error = core::convert::Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for ChannelIndex {
    type Error = core::convert::Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliability_matches_method() {
        assert_eq!(Reliability::Unreliable, DeliveryMethod::Unreliable.reliability());
        assert_eq!(
            Reliability::Unreliable,
            DeliveryMethod::UnreliableSequenced.reliability()
        );
        assert_eq!(
            Reliability::Reliable,
            DeliveryMethod::ReliableUnordered.reliability()
        );
        assert_eq!(
            Reliability::Reliable,
            DeliveryMethod::ReliableSequenced.reliability()
        );
        assert_eq!(
            Reliability::Reliable,
            DeliveryMethod::ReliableOrdered.reliability()
        );
    }

    #[test]
    fn only_reliable_ordered_is_ordered() {
        assert!(DeliveryMethod::ReliableOrdered.is_ordered());
        assert!(!DeliveryMethod::ReliableSequenced.is_ordered());
        assert!(!DeliveryMethod::ReliableUnordered.is_ordered());
        assert!(!DeliveryMethod::Unreliable.is_ordered());
        assert!(!DeliveryMethod::UnreliableSequenced.is_ordered());
    }
}
