//! Per-channel sequencing state: send-side sequence counters, and
//! receive-side dedup/ordering windows.
//!
//! A [`ChannelState`] exists for every `(delivery method, channel index)`
//! pair the connection is configured with, held in a flat [`ChannelTable`]
//! indexed the same way [`crate::message::MessageType`] packs its wire byte.
//! Which receive-side method is called depends on the channel's
//! [`crate::lane::DeliveryMethod`] (decided by the caller in
//! [`crate::conn::Connection`], not by this module):
//!
//! - plain `Unreliable`: no receive-side bookkeeping at all, every message is
//!   accepted.
//! - `UnreliableSequenced` and `ReliableSequenced`: [`ChannelState::on_receive_sequenced`].
//! - `ReliableUnordered` and `ReliableOrdered`: [`ChannelState::on_receive_reliable`].

use {
    crate::{
        message::MessageType,
        seq::{Seq, relate},
    },
    octs::Bytes,
    std::collections::{BTreeMap, VecDeque},
};

/// Send- and receive-side state for one sequence channel.
#[derive(Debug, Default)]
pub struct ChannelState {
    next_send_seq: Seq,
    last_received_sequenced: Option<Seq>,
    next_expected_reliable: Seq,
    /// `received[i]` is set if `next_expected_reliable + i` has already been
    /// received, including `i == 0` (the in-order cursor itself, once its
    /// message has arrived but before [`ChannelState::drain_ready`] has
    /// advanced past it).
    received: VecDeque<bool>,
    /// Payloads received early on an ordered channel, withheld until the gap
    /// before them fills in. Empty for non-ordered methods.
    withheld: BTreeMap<Seq, Bytes>,
}

impl ChannelState {
    /// Allocates the next sequence number for an outgoing message on this
    /// channel, advancing the channel's send cursor.
    pub fn stamp_outgoing(&mut self) -> Seq {
        let seq = self.next_send_seq;
        self.next_send_seq += Seq(1);
        seq
    }

    /// Decides whether an inbound sequenced message should be accepted, for
    /// `UnreliableSequenced` and `ReliableSequenced` channels: only a message
    /// strictly newer than the last accepted one is ever accepted.
    pub fn on_receive_sequenced(&mut self, seq: Seq) -> SequencedAccept {
        let is_newer = match self.last_received_sequenced {
            None => true,
            Some(last) => relate(seq, last) > 0,
        };
        if is_newer {
            self.last_received_sequenced = Some(seq);
            SequencedAccept::Accept
        } else {
            SequencedAccept::Reject
        }
    }

    /// Decides whether an inbound reliable message should be accepted, for
    /// `ReliableUnordered` and `ReliableOrdered` channels.
    ///
    /// `ordered` selects whether an early message is withheld (`true`,
    /// `ReliableOrdered`) or released immediately (`false`,
    /// `ReliableUnordered`). After any [`Accept::InOrder`] or
    /// [`Accept::EarlyReleased`], call [`ChannelState::drain_ready`] to
    /// advance the cursor and collect any now-consecutive messages.
    pub fn on_receive_reliable(&mut self, seq: Seq, ordered: bool, payload: Bytes) -> Accept {
        let dist = relate(seq, self.next_expected_reliable);
        if dist < 0 {
            return Accept::Duplicate;
        }

        #[expect(clippy::cast_sign_loss, reason = "dist >= 0 was just checked")]
        let offset = dist as usize;
        while self.received.len() <= offset {
            self.received.push_back(false);
        }
        if self.received[offset] {
            return Accept::Duplicate;
        }
        self.received[offset] = true;

        if dist == 0 {
            return Accept::InOrder(payload);
        }

        if ordered {
            self.withheld.insert(seq, payload);
            Accept::EarlyWithheld
        } else {
            Accept::EarlyReleased(payload)
        }
    }

    /// Call after any non-duplicate [`Accept`] to advance the in-order cursor
    /// past every sequence number that is now consecutively marked received,
    /// releasing withheld payloads on an ordered channel as their gap fills
    /// in. A no-op if the cursor's own sequence hasn't arrived yet.
    ///
    /// Returned payloads are in ascending sequence order.
    pub fn drain_ready(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while self.received.front() == Some(&true) {
            self.received.pop_front();
            let seq = self.next_expected_reliable;
            self.next_expected_reliable += Seq(1);
            if let Some(payload) = self.withheld.remove(&seq) {
                out.push(payload);
            }
        }
        out
    }
}

/// Outcome of [`ChannelState::on_receive_sequenced`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencedAccept {
    /// Strictly newer than the last accepted message; release it.
    Accept,
    /// Not newer than the last accepted message; drop it.
    Reject,
}

/// Outcome of [`ChannelState::on_receive_reliable`].
#[derive(Debug)]
pub enum Accept {
    /// Exactly the expected next sequence number; release immediately, then
    /// call [`ChannelState::drain_ready`] to advance the cursor and collect
    /// any messages this unblocks.
    InOrder(Bytes),
    /// Ahead of the expected sequence number, and this is an unordered
    /// channel; release immediately (out of order), then call
    /// [`ChannelState::drain_ready`] to advance the cursor.
    EarlyReleased(Bytes),
    /// Ahead of the expected sequence number, and this is an ordered
    /// channel; stored internally, nothing to release yet.
    EarlyWithheld,
    /// Already received (behind the window or bit already set); drop.
    Duplicate,
}

/// A flat table of [`ChannelState`]s, one per `(method, channel)` pair,
/// indexed the same way [`MessageType::user`] packs its wire byte.
///
/// [`MessageType::user`]: crate::message::MessageType::user
#[derive(Debug)]
pub struct ChannelTable {
    channels: Vec<ChannelState>,
}

impl ChannelTable {
    /// Creates a table sized for `channels_per_method` channels per
    /// non-library delivery method.
    #[must_use]
    pub fn new(channels_per_method: u8) -> Self {
        let len = usize::from(channels_per_method) * crate::lane::NUM_DELIVERY_METHODS;
        Self {
            channels: (0..len).map(|_| ChannelState::default()).collect(),
        }
    }

    /// Gets the channel state for a given wire message type, or `None` if
    /// `ty` is [`MessageType::LIBRARY`] or otherwise out of range.
    pub fn get_mut(&mut self, ty: MessageType) -> Option<&mut ChannelState> {
        if ty == MessageType::LIBRARY {
            return None;
        }
        self.channels.get_mut(usize::from(ty.0) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(byte: u8) -> Bytes {
        Bytes::copy_from_slice(&[byte])
    }

    #[test]
    fn stamp_outgoing_increments() {
        let mut ch = ChannelState::default();
        assert_eq!(Seq(0), ch.stamp_outgoing());
        assert_eq!(Seq(1), ch.stamp_outgoing());
    }

    #[test]
    fn sequenced_rejects_stale() {
        let mut ch = ChannelState::default();
        assert_eq!(SequencedAccept::Accept, ch.on_receive_sequenced(Seq(5)));
        assert_eq!(SequencedAccept::Reject, ch.on_receive_sequenced(Seq(3)));
        assert_eq!(SequencedAccept::Accept, ch.on_receive_sequenced(Seq(6)));
    }

    #[test]
    fn reliable_ordered_withholds_and_drains_in_order() {
        let mut ch = ChannelState::default();
        assert!(matches!(
            ch.on_receive_reliable(Seq(2), true, payload(2)),
            Accept::EarlyWithheld
        ));
        assert!(matches!(
            ch.on_receive_reliable(Seq(1), true, payload(1)),
            Accept::EarlyWithheld
        ));
        let Accept::InOrder(first) = ch.on_receive_reliable(Seq(0), true, payload(0)) else {
            panic!("expected in-order accept");
        };
        assert_eq!(payload(0), first);
        let drained = ch.drain_ready();
        assert_eq!(vec![payload(1), payload(2)], drained);
    }

    #[test]
    fn reliable_unordered_releases_immediately() {
        let mut ch = ChannelState::default();
        assert!(matches!(
            ch.on_receive_reliable(Seq(1), false, payload(1)),
            Accept::EarlyReleased(_)
        ));
        // the later in-order arrival just advances the window, nothing to
        // drain since it was already released
        let Accept::InOrder(_) = ch.on_receive_reliable(Seq(0), false, payload(0)) else {
            panic!("expected in-order accept");
        };
        assert!(ch.drain_ready().is_empty());
    }

    #[test]
    fn duplicate_reliable_rejected() {
        let mut ch = ChannelState::default();
        let _ = ch.on_receive_reliable(Seq(0), true, payload(0));
        assert!(matches!(
            ch.on_receive_reliable(Seq(0), true, payload(0)),
            Accept::Duplicate
        ));
    }

    #[test]
    fn channel_table_maps_library_to_none() {
        let mut table = ChannelTable::new(4);
        assert!(table.get_mut(MessageType::LIBRARY).is_none());
    }
}
