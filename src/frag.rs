//! Handles splitting large messages into smaller fragments, and reassembling
//! fragments back into messages.
//!
//! Packets are limited in size, usually to ~1000 bytes over a network. To be
//! able to send larger messages, we need a strategy to break down a large
//! message into smaller fragments, and send those fragments as packets over
//! the network (see [`split`]). On the receiving end, we combine these
//! fragments back up in order, and reassemble them into a full message (see
//! [`FragmentReceiver`]).

use {
    crate::{
        limit::{Limit, NotEnoughCounts},
        seq::Seq,
    },
    ahash::HashMap,
    bit_vec::BitVec,
    derive_more::{Display, Error},
    octs::{BufTooShortOr, Bytes, Decode, Encode, FixedEncodeLen, Read, Write, chunks::ByteChunksExt},
    std::{fmt, iter::FusedIterator},
};

/// Position of a single fragment within the full set of fragments a message
/// was split into.
///
/// Written to the wire directly after a [`crate::message::MessageHeader`],
/// only for messages which were actually fragmented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct FragmentPosition {
    /// Index of this fragment, starting at 0.
    pub index: u16,
    /// Total number of fragments the message was split into.
    pub total: u16,
}

impl FragmentPosition {
    /// Gets whether this is the last fragment in the set, i.e. the one with
    /// the highest index.
    #[must_use]
    pub const fn is_last(self) -> bool {
        self.index + 1 == self.total
    }
}

impl FixedEncodeLen for FragmentPosition {
    const ENCODE_LEN: usize = u16::ENCODE_LEN + u16::ENCODE_LEN;
}

impl Encode for FragmentPosition {
    type Error = core::convert::Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.index)?;
        dst.write(&self.total)?;
        Ok(())
    }
}

impl Decode for FragmentPosition {
    type Error = core::convert::Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            index: src.read()?,
            total: src.read()?,
        })
    }
}

/// Splits a message up into smaller fragments, ready to be reassembled by a
/// [`FragmentReceiver`].
///
/// The maximum length that a single fragment's payload will be is determined
/// by `max_frag_len`.
///
/// Fragments will be returned in the opposite order to the fragment's index.
/// For example, if you pass a message which is split into fragments `A, B, C`,
/// the iterator will return them in the order `C, B, A`. This is done to make
/// receiving fragments more efficient, since when the receiver receives `C`
/// (the fragment with `total` already known), it can allocate the right sized
/// buffer up front to fit this message.
///
/// Note that even if `C` is lost, it will make reassembly slightly less
/// efficient as the receiver will have to resize its buffer when re-receiving
/// `C` later, but the logic will still behave correctly.
///
/// # Errors
///
/// Errors if the message is too big, and will be split into more than
/// [`u16::MAX`] fragments. Realistically, you should never run into this as
/// long as your messages are of reasonable length.
///
/// # Panics
///
/// Panics if `max_frag_len == 0`.
pub fn split(
    max_frag_len: usize,
    msg: Bytes,
) -> Result<
    impl ExactSizeIterator<Item = (FragmentPosition, Bytes)> + DoubleEndedIterator + FusedIterator,
    MessageTooBig,
> {
    assert!(max_frag_len > 0);

    let byte_len = msg.len();
    let iter = msg.byte_chunks(max_frag_len);
    let num_frags = iter.len();

    let total = u16::try_from(num_frags).map_err(|_| MessageTooBig {
        byte_len,
        num_frags,
    })?;

    Ok(iter.enumerate().rev().map(move |(index, payload)| {
        #[expect(clippy::cast_possible_truncation, reason = "index < total <= u16::MAX")]
        let position = FragmentPosition {
            index: index as u16,
            total,
        };
        (position, payload)
    }))
}

/// Passed a message to [`split`] which was too long in length, and cannot be
/// represented in [`u16::MAX`] number of fragments.
#[derive(Debug, Clone, Display, Error)]
#[display("message too big - byte length: {byte_len}, num frags: {num_frags} / {}", u16::MAX)]
pub struct MessageTooBig {
    /// How long the message is, in bytes.
    pub byte_len: usize,
    /// How many fragments this message would take up.
    pub num_frags: usize,
}

/// Receives fragments created by [`split`] and reassembles them into full
/// messages.
#[derive(Default, Clone)]
pub struct FragmentReceiver {
    msgs: HashMap<Seq, MessageBuf>,
}

/// Received an invalid fragment when reassembling fragments into a message.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ReassembleError {
    /// Already received a fragment with this index.
    #[display("already received fragment {index}")]
    AlreadyReceivedFrag {
        /// Index of the fragment received.
        index: usize,
    },
    /// Not enough free memory to buffer this fragment up.
    #[display("out of memory - not enough bytes left in the reassembly budget")]
    OutOfMemory,
    /// Received a fragment which disagrees with the `total` already recorded
    /// for this message sequence.
    #[display("fragment claims total {total}, but {expected} was already recorded")]
    InconsistentTotal {
        /// Total claimed by this fragment.
        total: u16,
        /// Total already recorded from an earlier fragment.
        expected: u16,
    },
    /// Received a non-last fragment which has an invalid length.
    ///
    /// All non-last fragments must be the same size.
    #[display("non-last fragment {index} has invalid length {len}, expected {expected}")]
    InvalidPayloadLength {
        /// Index of the fragment received.
        index: usize,
        /// Length of the fragment received.
        len: usize,
        /// Expected fragment length.
        expected: usize,
    },
}

#[derive(Default, Clone)]
struct MessageBuf {
    total: Option<u16>,
    num_frags_recv: usize,
    frag_indices_recv: BitVec,
    payload: Vec<u8>,
}

impl fmt::Debug for FragmentReceiver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let seqs = self.msgs.keys().collect::<Vec<_>>();
        f.debug_struct("FragmentReceiver")
            .field("msgs", &seqs)
            .finish()
    }
}

impl FragmentReceiver {
    /// Gets the number of messages which are currently being reassembled, but
    /// have not been fully reassembled yet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    /// Returns `true` if there are no messages which are currently being
    /// reassembled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    /// Receives a single message fragment created from [`split`] and attempts
    /// to reassemble it into a full message.
    ///
    /// - `max_frag_len`: maximum length of a single non-last fragment; must be
    ///   the same as the value passed into [`split`]
    /// - `budget`: tracks remaining bytes of memory available for buffering
    ///   reassembly state for this connection
    /// - `msg_seq`: sequence number of this message; all fragments for a single
    ///   message sequence will be reassembled as one message
    /// - `position`: index + total count of this fragment
    /// - `payload`: fragment payload
    ///
    /// If all fragments of this message have been received, this will return
    /// `Ok(Some(msg))` with ownership of the reassembled message bytes.
    ///
    /// # Memory exhaustion
    ///
    /// One potential attack vector is a malicious sender sending many fragments
    /// of partially-completed messages, but never sending the final fragments,
    /// so the receiver is forced to keep the fragments in memory. To avoid
    /// this, receivers pass a `budget` tracking the reassembly memory left for
    /// this connection, and if buffering a fragment would grow a buffer past
    /// what remains in the budget, this returns
    /// [`ReassembleError::OutOfMemory`] and nothing is consumed from `budget`.
    ///
    /// # Errors
    ///
    /// Errors if the fragment received is unexpected for the current state of
    /// reassembly.
    ///
    /// Errors must not be treated as fatal, as they may happen due to network
    /// conditions such as duplicated or lost packets. Errors will not cause any
    /// invalid state.
    ///
    /// # Panics
    ///
    /// Panics if `max_frag_len` is 0.
    pub fn reassemble(
        &mut self,
        max_frag_len: usize,
        budget: &mut impl Limit,
        msg_seq: Seq,
        position: FragmentPosition,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, ReassembleError> {
        assert!(max_frag_len > 0);

        let buf = self.msgs.entry(msg_seq).or_default();
        let frag_index = usize::from(position.index);

        if buf.frag_indices_recv.get(frag_index) == Some(true) {
            return Err(ReassembleError::AlreadyReceivedFrag { index: frag_index });
        }

        if let Some(expected) = buf.total {
            if expected != position.total {
                return Err(ReassembleError::InconsistentTotal {
                    total: position.total,
                    expected,
                });
            }
        } else {
            buf.total = Some(position.total);
        }

        if !position.is_last() && payload.len() != max_frag_len {
            return Err(ReassembleError::InvalidPayloadLength {
                index: frag_index,
                len: payload.len(),
                expected: max_frag_len,
            });
        }

        let start = frag_index * max_frag_len;
        let end = start + payload.len();

        let payload_mem_required = end.saturating_sub(buf.payload.capacity());
        let indices_mem_required = frag_index
            .saturating_sub(buf.frag_indices_recv.capacity())
            .div_ceil(8);
        let mem_required = payload_mem_required + indices_mem_required;

        let consume = match budget.try_consume(mem_required) {
            Ok(consume) => consume,
            Err(NotEnoughCounts) => return Err(ReassembleError::OutOfMemory),
        };
        consume.consume();

        let new_payload_len = buf.payload.len().max(end);
        buf.payload.resize(new_payload_len, 0);

        let grow_len = (frag_index + 1).saturating_sub(buf.frag_indices_recv.len());
        buf.frag_indices_recv.grow(grow_len, false);

        buf.payload[start..end].copy_from_slice(payload);
        buf.frag_indices_recv.set(frag_index, true);
        buf.num_frags_recv += 1;

        if buf.total.is_some_and(|total| buf.num_frags_recv >= usize::from(total)) {
            let buf = self.msgs.remove(&msg_seq).expect(
                "we already have a mut ref to the buffer at this key, so we should be able to \
                 remove and take ownership of it",
            );
            Ok(Some(buf.payload))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::limit::ByteBucket};

    #[test]
    fn position_encode_decode_round_trips() {
        use octs::test::hint_round_trip;
        hint_round_trip(&FragmentPosition { index: 0, total: 1 });
        hint_round_trip(&FragmentPosition { index: 41, total: 42 });
        hint_round_trip(&FragmentPosition {
            index: u16::MAX - 1,
            total: u16::MAX,
        });
    }

    #[test]
    fn round_trip() {
        let max_frag_len = 8;
        let msg = Bytes::from_static(b"hello world! goodbye woorld!");

        let iter = split(max_frag_len, msg).unwrap();

        let mut recv = FragmentReceiver::default();
        let mut budget = ByteBucket::new(1024);
        let msg_seq = Seq(0);

        let mut result = None;
        for (position, payload) in iter {
            result = recv
                .reassemble(max_frag_len, &mut budget, msg_seq, position, &payload)
                .unwrap();
        }

        assert_eq!(
            b"hello world! goodbye woorld!".as_slice(),
            result.unwrap().as_slice()
        );
        assert!(recv.is_empty());
    }

    #[test]
    fn duplicate_fragment_is_rejected() {
        let max_frag_len = 8;
        let msg = Bytes::from_static(b"hello world! goodbye woorld!");
        let mut iter = split(max_frag_len, msg).unwrap();

        let mut recv = FragmentReceiver::default();
        let mut budget = ByteBucket::new(1024);
        let msg_seq = Seq(0);

        let (position, payload) = iter.next().unwrap();
        recv.reassemble(max_frag_len, &mut budget, msg_seq, position, &payload)
            .unwrap();
        let err = recv
            .reassemble(max_frag_len, &mut budget, msg_seq, position, &payload)
            .unwrap_err();
        assert!(matches!(err, ReassembleError::AlreadyReceivedFrag { .. }));
    }

    #[test]
    fn out_of_memory_consumes_nothing() {
        let max_frag_len = 8;
        let msg = Bytes::from_static(b"hello world! goodbye woorld!");
        let mut iter = split(max_frag_len, msg).unwrap();

        let mut recv = FragmentReceiver::default();
        let mut budget = ByteBucket::new(2);
        let msg_seq = Seq(0);

        let (position, payload) = iter.next().unwrap();
        let err = recv
            .reassemble(max_frag_len, &mut budget, msg_seq, position, &payload)
            .unwrap_err();
        assert!(matches!(err, ReassembleError::OutOfMemory));
        assert_eq!(2, budget.rem());
    }
}
