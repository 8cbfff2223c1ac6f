//! Internal protocol messages exchanged between peers, as opposed to
//! application [`crate::message::OutgoingMessage`] data.
//!
//! Every library message is identified by a [`LibraryMessageType`] discriminant
//! byte written immediately after the outer [`crate::message::MessageHeader`]
//! (whose `ty` field is always [`crate::message::MessageType::LIBRARY`] for
//! these).

use {
    crate::{message::MessageType, seq::Seq},
    core::convert::Infallible,
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// Discriminates which [`LibraryMessage`] variant a library payload encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[repr(u8)]
pub enum LibraryMessageType {
    /// Initiator requests a new connection.
    Connect = 0,
    /// Responder accepts a [`LibraryMessageType::Connect`].
    ConnectResponse = 1,
    /// Either side confirms the handshake is complete.
    ConnectionEstablished = 2,
    /// Either side is tearing the connection down.
    Disconnect = 3,
    /// RTT probe, answered by [`LibraryMessageType::Pong`].
    Ping = 4,
    /// Answer to a [`LibraryMessageType::Ping`].
    Pong = 5,
    /// Zero-payload traffic sent purely to refresh the peer's
    /// last-heard-from timestamp.
    KeepAlive = 6,
    /// Carries a run-length-encoded list of acknowledged `(type, seq)` pairs.
    Acknowledge = 7,
}

impl LibraryMessageType {
    /// Converts a raw wire byte into a known variant, if recognized.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Connect),
            1 => Some(Self::ConnectResponse),
            2 => Some(Self::ConnectionEstablished),
            3 => Some(Self::Disconnect),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            6 => Some(Self::KeepAlive),
            7 => Some(Self::Acknowledge),
            _ => None,
        }
    }
}

impl FixedEncodeLen for LibraryMessageType {
    const ENCODE_LEN: usize = u8::ENCODE_LEN;
}

impl Encode for LibraryMessageType {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&(*self as u8))
    }
}

/// A fully decoded library message, with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum LibraryMessage {
    /// See [`LibraryMessageType::Connect`].
    Connect,
    /// See [`LibraryMessageType::ConnectResponse`].
    ConnectResponse,
    /// See [`LibraryMessageType::ConnectionEstablished`].
    ConnectionEstablished,
    /// See [`LibraryMessageType::Disconnect`].
    Disconnect(DisconnectPayload),
    /// See [`LibraryMessageType::Ping`].
    Ping(PingPayload),
    /// See [`LibraryMessageType::Pong`].
    Pong(PongPayload),
    /// See [`LibraryMessageType::KeepAlive`].
    KeepAlive,
    /// See [`LibraryMessageType::Acknowledge`].
    Acknowledge(AcknowledgePayload),
}

impl LibraryMessage {
    /// Gets the discriminant of this message.
    #[must_use]
    pub const fn ty(&self) -> LibraryMessageType {
        match self {
            Self::Connect => LibraryMessageType::Connect,
            Self::ConnectResponse => LibraryMessageType::ConnectResponse,
            Self::ConnectionEstablished => LibraryMessageType::ConnectionEstablished,
            Self::Disconnect(_) => LibraryMessageType::Disconnect,
            Self::Ping(_) => LibraryMessageType::Ping,
            Self::Pong(_) => LibraryMessageType::Pong,
            Self::KeepAlive => LibraryMessageType::KeepAlive,
            Self::Acknowledge(_) => LibraryMessageType::Acknowledge,
        }
    }

    /// Encodes the discriminant byte followed by the payload.
    ///
    /// # Errors
    ///
    /// Errors if `dst` runs out of space.
    pub fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Infallible>> {
        dst.write(&self.ty())?;
        match self {
            Self::Connect | Self::ConnectResponse | Self::ConnectionEstablished | Self::KeepAlive => {}
            Self::Disconnect(payload) => payload.encode(dst)?,
            Self::Ping(payload) => dst.write(payload)?,
            Self::Pong(payload) => dst.write(payload)?,
            Self::Acknowledge(payload) => payload.encode(dst)?,
        }
        Ok(())
    }

    /// Decodes a discriminant byte and its payload.
    ///
    /// # Errors
    ///
    /// Errors if `src` is malformed or truncated, or the discriminant is
    /// unrecognized.
    pub fn decode(mut src: impl Read) -> Result<Self, LibraryDecodeError> {
        let raw: u8 = src.read().map_err(LibraryDecodeError::BufTooShort)?;
        let ty = LibraryMessageType::from_u8(raw).ok_or(LibraryDecodeError::UnknownType { raw })?;
        Ok(match ty {
            LibraryMessageType::Connect => Self::Connect,
            LibraryMessageType::ConnectResponse => Self::ConnectResponse,
            LibraryMessageType::ConnectionEstablished => Self::ConnectionEstablished,
            LibraryMessageType::Disconnect => {
                Self::Disconnect(DisconnectPayload::decode(src).map_err(LibraryDecodeError::BufTooShort)?)
            }
            LibraryMessageType::Ping => Self::Ping(src.read().map_err(LibraryDecodeError::BufTooShort)?),
            LibraryMessageType::Pong => Self::Pong(src.read().map_err(LibraryDecodeError::BufTooShort)?),
            LibraryMessageType::KeepAlive => Self::KeepAlive,
            LibraryMessageType::Acknowledge => {
                Self::Acknowledge(AcknowledgePayload::decode(src).map_err(LibraryDecodeError::BufTooShort)?)
            }
        })
    }
}

/// Failed to decode a [`LibraryMessage`].
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
pub enum LibraryDecodeError {
    /// Ran out of bytes, or a fixed-size field was malformed.
    #[display("buffer too short or malformed")]
    BufTooShort(#[error(ignore)] BufTooShortOr<Infallible>),
    /// The discriminant byte did not match a known [`LibraryMessageType`].
    #[display("unknown library message type {raw}")]
    UnknownType {
        /// The raw byte which was not recognized.
        raw: u8,
    },
}

/// Payload of [`LibraryMessage::Ping`]: a single byte identifying this probe,
/// echoed back in the matching [`PongPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct PingPayload {
    /// Identifier of this ping, chosen by the sender.
    pub ping_id: u8,
}

impl FixedEncodeLen for PingPayload {
    const ENCODE_LEN: usize = u8::ENCODE_LEN;
}

impl Encode for PingPayload {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.ping_id)
    }
}

impl Decode for PingPayload {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self { ping_id: src.read()? })
    }
}

/// Payload of [`LibraryMessage::Pong`]: echoes the ping id, and carries the
/// responder's local clock reading (unused for RTT math beyond being
/// available for diagnostics; the RTT itself is measured as elapsed time
/// since the matching ping was sent).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct PongPayload {
    /// Identifier copied from the originating [`PingPayload`].
    pub ping_id: u8,
    /// Responder's local time, as seconds since an arbitrary epoch.
    pub remote_time_secs: f64,
}

impl FixedEncodeLen for PongPayload {
    const ENCODE_LEN: usize = u8::ENCODE_LEN + 8;
}

impl Encode for PongPayload {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.ping_id)?;
        dst.write(&self.remote_time_secs)?;
        Ok(())
    }
}

impl Decode for PongPayload {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            ping_id: src.read()?,
            remote_time_secs: src.read()?,
        })
    }
}

/// Payload of [`LibraryMessage::Disconnect`]: a length-prefixed UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPayload {
    /// Human-readable reason, shown to the application via a status event.
    pub reason: String,
}

impl DisconnectPayload {
    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Infallible>> {
        let bytes = self.reason.as_bytes();
        #[expect(clippy::cast_possible_truncation, reason = "reason strings are kept short")]
        let len = bytes.len().min(usize::from(u16::MAX)) as u16;
        dst.write(&len)?;
        for &byte in &bytes[..usize::from(len)] {
            dst.write(&byte)?;
        }
        Ok(())
    }

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Infallible>> {
        let len: u16 = src.read()?;
        let mut bytes = Vec::with_capacity(usize::from(len));
        for _ in 0..len {
            bytes.push(src.read()?);
        }
        let reason = String::from_utf8_lossy(&bytes).into_owned();
        Ok(Self { reason })
    }
}

/// A single acknowledged message or consecutive run of acknowledged messages
/// on one `(type)` wire entry.
///
/// Encoded as `type (1) + start_seq (2) + run_len_minus_one (1)`, i.e. 4
/// bytes regardless of whether the run has length 1 or more - this rewrite
/// does not special-case a 3-byte single-entry encoding, trading one byte
/// per singleton ack for a single uniform decode path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRun {
    /// Wire type shared by every sequence number in this run.
    pub ty: MessageType,
    /// First (lowest, modularly) sequence number in the run.
    pub start_seq: Seq,
    /// Number of consecutive sequence numbers covered, minus one.
    pub run_len_minus_one: u8,
}

impl AckRun {
    /// Number of sequence numbers this run covers.
    #[must_use]
    pub const fn len(self) -> u16 {
        self.run_len_minus_one as u16 + 1
    }

    /// Iterates the individual `(type, seq)` pairs this run covers.
    pub fn seqs(self) -> impl Iterator<Item = Seq> {
        let start = self.start_seq;
        (0..self.len()).map(move |i| start + Seq(i))
    }
}

impl FixedEncodeLen for AckRun {
    const ENCODE_LEN: usize = MessageType::ENCODE_LEN + Seq::ENCODE_LEN + u8::ENCODE_LEN;
}

impl Encode for AckRun {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.ty)?;
        dst.write(&self.start_seq)?;
        dst.write(&self.run_len_minus_one)?;
        Ok(())
    }
}

impl Decode for AckRun {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self {
            ty: src.read()?,
            start_seq: src.read()?,
            run_len_minus_one: src.read()?,
        })
    }
}

/// Payload of [`LibraryMessage::Acknowledge`]: a list of [`AckRun`]s,
/// length-prefixed by a single byte (bounding a packet to ≤255 runs, which a
/// single MTU-sized packet could never exceed in practice).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcknowledgePayload {
    /// Runs of acknowledged sequence numbers.
    pub runs: Vec<AckRun>,
}

impl AcknowledgePayload {
    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Infallible>> {
        #[expect(clippy::cast_possible_truncation, reason = "caller bounds runs.len() <= 255")]
        let count = self.runs.len().min(255) as u8;
        dst.write(&count)?;
        for run in self.runs.iter().take(usize::from(count)) {
            dst.write(run)?;
        }
        Ok(())
    }

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Infallible>> {
        let count: u8 = src.read()?;
        let mut runs = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            runs.push(src.read()?);
        }
        Ok(Self { runs })
    }

    /// Encoded length in bytes of this payload.
    #[must_use]
    pub fn encode_len(&self) -> usize {
        1 + self.runs.len() * AckRun::ENCODE_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_run_seqs() {
        let run = AckRun {
            ty: MessageType::LIBRARY,
            start_seq: Seq(10),
            run_len_minus_one: 2,
        };
        assert_eq!(vec![Seq(10), Seq(11), Seq(12)], run.seqs().collect::<Vec<_>>());
    }

    #[test]
    fn disconnect_payload_round_trips() {
        use octs::Bytes as OctsBytes;
        let payload = DisconnectPayload {
            reason: "timed out".to_owned(),
        };
        let mut buf = Vec::new();
        payload.encode(&mut buf).unwrap();
        let decoded = DisconnectPayload::decode(OctsBytes::from(buf)).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn acknowledge_payload_round_trips() {
        use octs::Bytes as OctsBytes;
        let payload = AcknowledgePayload {
            runs: vec![
                AckRun {
                    ty: MessageType::LIBRARY,
                    start_seq: Seq(0),
                    run_len_minus_one: 0,
                },
                AckRun {
                    ty: MessageType(1),
                    start_seq: Seq(65534),
                    run_len_minus_one: 4,
                },
            ],
        };
        let mut buf = Vec::new();
        payload.encode(&mut buf).unwrap();
        let decoded = AcknowledgePayload::decode(OctsBytes::from(buf)).unwrap();
        assert_eq!(payload, decoded);
    }
}
