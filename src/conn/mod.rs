//! The per-connection protocol engine: [`Connection`].
//!
//! A [`Connection`] owns everything needed to carry on a conversation with a
//! single remote peer - handshake progress, the per-channel send/receive
//! state, outstanding unacknowledged sends, and the throttle and reassembly
//! budgets - but it never touches a socket, a clock, or an allocator
//! directly. Those are handed in by the caller through the collaborator
//! traits in [`crate::collab`], once per call to [`Connection::on_packet`] or
//! [`Connection::heartbeat`]. This keeps the engine itself single-threaded
//! and trivially testable: feed it packets and advance its clock by hand, and
//! it behaves exactly as it would wired up to a real socket.
//!
//! The internal state machine names mirror Lidgren.Network's connection
//! states fairly literally, because that turned out to be the cleanest way
//! to express the handshake: an initiator goes
//! `InitiatedConnect -> Connected`, a responder goes
//! `RespondedConnect -> Connected`, and either side can move to
//! `Disconnecting -> Disconnected` at any point. There is no persisted
//! `None` state - a [`Connection`] value only exists once a handshake has at
//! least begun, so "not yet connecting" is represented by the absence of a
//! `Connection` rather than a variant of it.
//!
//! The send/receive pipeline driven by [`Connection::heartbeat`] lives in
//! [`heartbeat`], split out because it is the single largest piece of
//! behavior in the engine.

mod heartbeat;

use {
    crate::{
        ack::AckQueue,
        channel::{Accept, ChannelTable, SequencedAccept},
        collab::{ConnectionReset, MessagePool, PacketSink},
        config::Config,
        error::SendError,
        frag::{self, FragmentPosition, FragmentReceiver},
        lane::{ChannelIndex, DeliveryMethod, Reliability},
        library::{AcknowledgePayload, DisconnectPayload, LibraryMessage, LibraryMessageType, PingPayload, PongPayload},
        limit::{ByteBucket, Limit},
        message::{Kind, MessageHeader, MessageType, OutgoingMessage, SendingRecord, SharedMessage},
        rtt::RttEstimator,
        seq::Seq,
    },
    ahash::HashMap,
    log::warn,
    octs::{Bytes, Decode, Encode, FixedEncodeLen},
    std::{collections::VecDeque, net::SocketAddr, time::Instant},
};

/// Number of heartbeat invocations between "greater work" passes: timeout
/// checks, handshake retries, and the unacked-sends resend scan.
const GREATER_WORK_PERIOD: u64 = 3;

/// Fraction of [`Config::timeout`] used as the period for both the
/// keep-alive and RTT-probe schedules, so a dead link is noticed well before
/// the timeout itself fires.
const PING_PERIOD_DIVISOR: u32 = 3;

/// Application-visible connection status.
///
/// Collapses a few internal handshake sub-states (see `InternalStatus`) that
/// an application never needs to distinguish between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Handshake in progress; not yet usable for [`Connection::send_message`].
    Connecting,
    /// Handshake complete; messages may be sent and received.
    Connected,
    /// Tearing down; any final unacked sends are being flushed before the
    /// local side moves to [`Status::Disconnected`].
    Disconnecting,
    /// No longer usable. The connection's owner should drop it.
    Disconnected,
}

/// Internal handshake/teardown state.
///
/// `RespondedConnect { pending_approval: true }` is the only state in which
/// an inbound connection waits on [`Connection::approve`] or
/// [`Connection::deny`] before handshake retries begin.
#[derive(Debug, Clone, PartialEq, Eq)]
enum InternalStatus {
    InitiatedConnect,
    RespondedConnect { pending_approval: bool },
    Connected,
    Disconnecting,
    Disconnected,
}

/// Something the application should be told about, pulled out of
/// [`Connection::events`] after a call to [`Connection::on_packet`] or
/// [`Connection::heartbeat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// [`Connection::status`] changed.
    StatusChanged(Status),
    /// The handshake completed; messages may now be sent.
    Connected,
    /// The connection is now unusable, for the given reason.
    Disconnected {
        /// Human-readable teardown reason, either supplied locally or
        /// received from the peer's [`LibraryMessage::Disconnect`].
        reason: String,
    },
    /// An inbound connection is awaiting [`Connection::approve`] or
    /// [`Connection::deny`] (only raised when [`Config::require_approval`]
    /// is set).
    ApprovalRequested,
}

/// A single received application message, pulled out of
/// [`Connection::recv_msgs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvMessage {
    /// Delivery method it was sent with.
    pub method: DeliveryMethod,
    /// Channel it was sent on.
    pub channel: ChannelIndex,
    /// Reassembled application payload.
    pub payload: Bytes,
    /// Local time at which it was received (the `now` passed to the
    /// [`Connection::on_packet`] call that produced it).
    pub recv_at: Instant,
}

/// Identifies a single outgoing message transmission, used to correlate an
/// inbound ack back to the send that produced it, via
/// [`Connection::recv_acks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    /// Wire type the message was sent as.
    pub ty: MessageType,
    /// Sequence number it was stamped with.
    pub seq: Seq,
}

/// Running counters for a [`Connection`], exposed read-only for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of packets handed to [`crate::collab::PacketSink::send_packet`].
    pub packets_sent: u64,
    /// Number of packets passed into [`Connection::on_packet`].
    pub packets_recv: u64,
    /// Number of message records written to the wire (each fragment counts
    /// separately).
    pub msgs_sent: u64,
    /// Number of application/library messages fully received (after
    /// reassembly, where applicable).
    pub msgs_recv: u64,
    /// Number of inbound messages dropped as duplicates.
    pub msgs_dropped_duplicate: u64,
    /// Number of individual sequence numbers acknowledged to the peer.
    pub acks_sent: u64,
    /// Number of individual sequence numbers the peer acknowledged to us.
    pub acks_recv: u64,
}

/// The protocol engine for a single remote peer.
///
/// See the module documentation for the overall shape. Construct one with
/// [`Connection::connect`] (we are the initiator) or [`Connection::accept`]
/// (we are the responder, reacting to an inbound `Connect` the caller has
/// already demultiplexed to us by remote address). Drive it by calling
/// [`Connection::on_packet`] for every inbound datagram and
/// [`Connection::heartbeat`] on a fixed schedule (see
/// [`Config::heartbeat_interval`]); both drain into [`Connection::events`],
/// [`Connection::recv_msgs`], and [`Connection::recv_acks`] for the caller to
/// consume afterwards.
#[derive(Debug)]
pub struct Connection {
    config: Config,
    remote_addr: SocketAddr,
    remote_uid: u64,
    tag: Option<String>,
    is_initiator: bool,
    started_at: Instant,

    status: InternalStatus,
    pending_disconnect_reason: Option<String>,
    last_heard_from: Instant,
    handshake_attempts: u32,
    handshake_next_attempt_at: Option<Instant>,

    channels: ChannelTable,
    frag_recv: HashMap<MessageType, FragmentReceiver>,
    lib_send_seq: Seq,

    next_record_id: u64,
    unsent: VecDeque<SendingRecord>,
    unacked: Vec<SendingRecord>,
    acks: AckQueue,

    rtt: RttEstimator,
    ping_id: u8,
    ping_sent_at: Option<(u8, Instant)>,
    next_ping_due: Instant,
    next_keepalive_due: Instant,

    send_budget: ByteBucket,
    reassembly_budget: ByteBucket,

    heartbeat_tick: u64,
    last_tick_at: Instant,

    stats: Stats,

    /// Reassembled application messages ready for the caller to take.
    pub recv_msgs: VecDeque<RecvMessage>,
    /// Keys of reliable sends the peer has just acknowledged.
    pub recv_acks: VecDeque<MessageKey>,
    /// Status changes and lifecycle notifications ready for the caller.
    pub events: VecDeque<ConnectionEvent>,
}

impl Connection {
    fn new_common(remote_addr: SocketAddr, remote_uid: u64, config: Config, now: Instant, is_initiator: bool, status: InternalStatus) -> Self {
        let channels = ChannelTable::new(config.channels_per_delivery_method);
        let send_budget = ByteBucket::new(config.throttle_peak_bytes);
        let reassembly_budget = ByteBucket::new(config.max_reassembly_bytes);
        Self {
            remote_addr,
            remote_uid,
            tag: None,
            is_initiator,
            started_at: now,
            status,
            pending_disconnect_reason: None,
            last_heard_from: now,
            handshake_attempts: 0,
            handshake_next_attempt_at: None,
            channels,
            frag_recv: HashMap::default(),
            lib_send_seq: Seq::default(),
            next_record_id: 0,
            unsent: VecDeque::new(),
            unacked: Vec::new(),
            acks: AckQueue::new(),
            rtt: RttEstimator::default(),
            ping_id: 0,
            ping_sent_at: None,
            next_ping_due: now,
            next_keepalive_due: now,
            send_budget,
            reassembly_budget,
            heartbeat_tick: 0,
            last_tick_at: now,
            stats: Stats::default(),
            recv_msgs: VecDeque::new(),
            recv_acks: VecDeque::new(),
            events: VecDeque::new(),
            config,
        }
    }

    /// Starts a connection as the initiating side: `Connect` will be sent on
    /// the next [`Connection::heartbeat`] that performs greater work, and
    /// retried every [`Config::handshake_attempt_delay`] until a
    /// `ConnectResponse` arrives or [`Config::handshake_max_attempts`] is
    /// exhausted.
    #[must_use]
    pub fn connect(remote_addr: SocketAddr, remote_uid: u64, config: Config, now: Instant) -> Self {
        Self::new_common(remote_addr, remote_uid, config, now, true, InternalStatus::InitiatedConnect)
    }

    /// Starts a connection as the responding side, reacting to an inbound
    /// `Connect` the caller has already associated with `remote_addr`.
    ///
    /// If [`Config::require_approval`] is set, [`ConnectionEvent::ApprovalRequested`]
    /// is raised immediately and no `ConnectResponse` is sent until
    /// [`Connection::approve`] is called.
    #[must_use]
    pub fn accept(remote_addr: SocketAddr, remote_uid: u64, config: Config, now: Instant) -> Self {
        let pending_approval = config.require_approval;
        let mut conn = Self::new_common(
            remote_addr,
            remote_uid,
            config,
            now,
            false,
            InternalStatus::RespondedConnect { pending_approval },
        );
        if pending_approval {
            conn.events.push_back(ConnectionEvent::ApprovalRequested);
        }
        conn
    }

    /// Current application-visible status.
    #[must_use]
    pub fn status(&self) -> Status {
        match &self.status {
            InternalStatus::InitiatedConnect | InternalStatus::RespondedConnect { .. } => Status::Connecting,
            InternalStatus::Connected => Status::Connected,
            InternalStatus::Disconnecting => Status::Disconnecting,
            InternalStatus::Disconnected => Status::Disconnected,
        }
    }

    /// The peer's socket address.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The peer's unique connection id, as supplied at construction.
    #[must_use]
    pub const fn remote_uid(&self) -> u64 {
        self.remote_uid
    }

    /// An arbitrary caller-assigned label for this connection, for logging.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Sets the caller-assigned label for this connection.
    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = Some(tag.into());
    }

    /// Running counters for this connection.
    #[must_use]
    pub const fn stats(&self) -> Stats {
        self.stats
    }

    /// Current round-trip time estimate.
    #[must_use]
    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Total bytes still queued to be written to the wire (not counting
    /// in-flight unacked sends awaiting a resend deadline).
    #[must_use]
    pub fn unsent_bytes(&self) -> usize {
        self.unsent.iter().map(|record| self.record_wire_len(record)).sum()
    }

    /// Queues an application message for sending.
    ///
    /// # Errors
    ///
    /// Errors if the connection is not [`Status::Connected`], `channel` is
    /// out of range for [`Config::channels_per_delivery_method`], or the
    /// payload is too large to ever be sent (see [`crate::frag::split`]).
    pub fn send_message(&mut self, payload: impl Into<Bytes>, method: DeliveryMethod, channel: ChannelIndex) -> Result<(), SendError> {
        if !matches!(self.status, InternalStatus::Connected) {
            return Err(SendError::NotConnected);
        }
        let max = self.config.channels_per_delivery_method;
        let ty = MessageType::user(method, channel, max).ok_or(SendError::ChannelOutOfRange { method, channel, max })?;
        self.enqueue_user(ty, payload.into())
    }

    /// Queues an internal protocol message for sending, bypassing the
    /// channel table.
    ///
    /// Exposed for advanced callers (e.g. forcing an out-of-schedule
    /// keep-alive); the handshake, ack, and ping/pong machinery uses this
    /// same path internally.
    ///
    /// # Errors
    ///
    /// Errors if the connection is not [`Status::Connected`].
    pub fn send_library(&mut self, msg: LibraryMessage) -> Result<(), SendError> {
        if !matches!(self.status, InternalStatus::Connected) {
            return Err(SendError::NotConnected);
        }
        self.enqueue_library(msg);
        Ok(())
    }

    /// Begins a graceful teardown: zeroes throttle debt, schedules every
    /// currently-unacked send for immediate resend ahead of anything already
    /// queued, then queues a `Disconnect` carrying `reason`.
    ///
    /// The connection does not finish moving to [`Status::Disconnected`]
    /// until that `Disconnect` is actually drained and written to the wire
    /// by a later [`Connection::heartbeat`] call.
    ///
    /// Idempotent: calling this again while already disconnecting or
    /// disconnected does nothing.
    pub fn disconnect(&mut self, reason: impl Into<String>) {
        if matches!(self.status, InternalStatus::Disconnecting | InternalStatus::Disconnected) {
            return;
        }
        self.status = InternalStatus::Disconnecting;
        self.send_budget.refill();

        let unacked = std::mem::take(&mut self.unacked);
        for record in unacked.into_iter().rev() {
            self.unsent.push_front(record);
        }

        let reason = reason.into();
        self.pending_disconnect_reason = Some(reason.clone());
        self.enqueue_library(LibraryMessage::Disconnect(DisconnectPayload { reason }));
        self.events.push_back(ConnectionEvent::StatusChanged(Status::Disconnecting));
    }

    /// Accepts an inbound connection that was awaiting approval, sending
    /// `ConnectResponse` on the next heartbeat.
    ///
    /// Does nothing if this connection isn't currently waiting on approval.
    pub fn approve(&mut self) {
        if let InternalStatus::RespondedConnect { pending_approval: true } = self.status {
            self.status = InternalStatus::RespondedConnect { pending_approval: false };
            self.handshake_next_attempt_at = None;
        }
    }

    /// Rejects an inbound connection that was awaiting approval, moving
    /// straight to teardown with `reason`.
    ///
    /// Does nothing if this connection isn't currently waiting on approval.
    pub fn deny(&mut self, reason: impl Into<String>) {
        if let InternalStatus::RespondedConnect { pending_approval: true } = self.status {
            self.disconnect_without_approval_guard(reason);
        }
    }

    fn disconnect_without_approval_guard(&mut self, reason: impl Into<String>) {
        self.status = InternalStatus::Disconnecting;
        let reason = reason.into();
        self.pending_disconnect_reason = Some(reason.clone());
        self.enqueue_library(LibraryMessage::Disconnect(DisconnectPayload { reason }));
        self.events.push_back(ConnectionEvent::StatusChanged(Status::Disconnecting));
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_record_id;
        self.next_record_id += 1;
        id
    }

    fn next_ping_id(&mut self) -> u8 {
        let id = self.ping_id;
        self.ping_id = self.ping_id.wrapping_add(1);
        id
    }

    fn enqueue_user(&mut self, ty: MessageType, payload: Bytes) -> Result<(), SendError> {
        let max_unfrag = self.config.max_unfragmented_payload_len();
        let channel = self
            .channels
            .get_mut(ty)
            .expect("ty was just constructed from a validated method/channel pair");
        let seq = channel.stamp_outgoing();

        if payload.len() <= max_unfrag {
            let msg = SharedMessage::new(OutgoingMessage { payload, lib_type: None }, 1);
            let id = self.next_id();
            self.unsent.push_back(SendingRecord::new(id, msg, ty, seq, None));
            return Ok(());
        }

        let max_frag = self.config.max_fragment_payload_len();
        let positions: Vec<FragmentPosition> = frag::split(max_frag, payload.clone())
            .map_err(|_err| SendError::MessageTooBig)?
            .map(|(position, _chunk)| position)
            .collect();
        let num_frags = positions.len();
        let msg = SharedMessage::new(OutgoingMessage { payload, lib_type: None }, num_frags);
        for position in positions {
            let id = self.next_id();
            self.unsent.push_back(SendingRecord::new(id, msg.clone(), ty, seq, Some(position)));
        }
        Ok(())
    }

    fn enqueue_library(&mut self, msg: LibraryMessage) {
        let seq = self.lib_send_seq;
        self.lib_send_seq += Seq(1);
        let mut buf = Vec::new();
        msg.encode(&mut buf).expect("encoding into a Vec never fails");
        let lib_msg = SharedMessage::new(
            OutgoingMessage {
                payload: Bytes::from(buf),
                lib_type: Some(msg.ty()),
            },
            1,
        );
        let id = self.next_id();
        self.unsent.push_back(SendingRecord::new(id, lib_msg, MessageType::LIBRARY, seq, None));
    }

    fn transition_connected(&mut self, now: Instant) {
        self.status = InternalStatus::Connected;
        self.handshake_attempts = 0;
        self.handshake_next_attempt_at = None;
        let ping_period = self.config.timeout / PING_PERIOD_DIVISOR;
        self.next_ping_due = now + ping_period;
        self.next_keepalive_due = now + ping_period;
        self.events.push_back(ConnectionEvent::StatusChanged(Status::Connected));
        self.events.push_back(ConnectionEvent::Connected);
    }

    fn transition_disconnected(&mut self, reason: String) {
        if matches!(self.status, InternalStatus::Disconnected) {
            return;
        }
        self.status = InternalStatus::Disconnected;
        self.events.push_back(ConnectionEvent::StatusChanged(Status::Disconnected));
        self.events.push_back(ConnectionEvent::Disconnected { reason });
    }

    /// Feeds a single inbound UDP payload (already demultiplexed to this
    /// connection by remote address) to the engine.
    ///
    /// Decodes and dispatches every message the packet contains; malformed
    /// or truncated trailing data is logged and the rest of the packet is
    /// dropped, never treated as fatal.
    pub fn on_packet(&mut self, now: Instant, packet: &[u8], pool: &mut impl MessagePool) {
        self.last_heard_from = now;
        self.stats.packets_recv += 1;
        let mut cursor = Bytes::copy_from_slice(packet);
        while !cursor.is_empty() {
            self.dispatch_one(now, &mut cursor, pool);
        }
    }

    fn dispatch_one(&mut self, now: Instant, cursor: &mut Bytes, pool: &mut impl MessagePool) {
        let Ok(header) = MessageHeader::decode(&mut *cursor) else {
            warn!("dropping malformed packet tail from {}", self.remote_addr);
            *cursor = Bytes::new();
            return;
        };
        let Ok(has_frag) = u8::decode(&mut *cursor) else {
            warn!("dropping truncated packet tail from {}", self.remote_addr);
            *cursor = Bytes::new();
            return;
        };
        let frag_pos = if has_frag == 0 {
            None
        } else {
            match FragmentPosition::decode(&mut *cursor) {
                Ok(position) => Some(position),
                Err(_err) => {
                    warn!("dropping truncated fragment header from {}", self.remote_addr);
                    *cursor = Bytes::new();
                    return;
                }
            }
        };

        let len = usize::from(header.len);
        if cursor.len() < len {
            warn!(
                "message from {} claims {len} bytes but only {} remain, dropping rest of packet",
                self.remote_addr,
                cursor.len()
            );
            *cursor = Bytes::new();
            return;
        }
        let payload = cursor.split_to(len);

        if header.ty == MessageType::LIBRARY {
            if frag_pos.is_some() {
                warn!("library message from {} claimed to be fragmented, dropping", self.remote_addr);
                return;
            }
            match LibraryMessage::decode(payload) {
                Ok(lib_msg) => self.handle_library(now, lib_msg, pool),
                Err(err) => warn!("malformed library message from {}: {err}", self.remote_addr),
            }
            return;
        }

        let Some(Kind::User(method, channel)) = header.ty.decode_kind(self.config.channels_per_delivery_method) else {
            warn!("unrecognized message type {:?} from {}", header.ty, self.remote_addr);
            return;
        };
        self.handle_user(now, header.ty, header.seq, method, channel, frag_pos, &payload);
    }

    fn handle_library(&mut self, now: Instant, msg: LibraryMessage, pool: &mut impl MessagePool) {
        match msg {
            LibraryMessage::Connect => {
                if let InternalStatus::RespondedConnect { pending_approval: false } = self.status {
                    self.enqueue_library(LibraryMessage::ConnectResponse);
                }
            }
            LibraryMessage::ConnectResponse => {
                if let InternalStatus::InitiatedConnect = self.status {
                    self.enqueue_library(LibraryMessage::ConnectionEstablished);
                    self.transition_connected(now);
                }
            }
            LibraryMessage::ConnectionEstablished => {
                if let InternalStatus::RespondedConnect { pending_approval: false } = self.status {
                    self.transition_connected(now);
                }
            }
            LibraryMessage::Disconnect(payload) => {
                self.transition_disconnected(payload.reason);
            }
            LibraryMessage::Ping(ping) => {
                let remote_time_secs = now.saturating_duration_since(self.started_at).as_secs_f64();
                self.enqueue_library(LibraryMessage::Pong(PongPayload {
                    ping_id: ping.ping_id,
                    remote_time_secs,
                }));
            }
            LibraryMessage::Pong(pong) => {
                if let Some((id, sent_at)) = self.ping_sent_at {
                    if id == pong.ping_id {
                        self.rtt.update(now.saturating_duration_since(sent_at));
                        self.ping_sent_at = None;
                    }
                }
            }
            LibraryMessage::KeepAlive => {}
            LibraryMessage::Acknowledge(payload) => self.handle_acknowledge(payload, pool),
        }
    }

    fn handle_acknowledge(&mut self, payload: AcknowledgePayload, pool: &mut impl MessagePool) {
        for run in payload.runs {
            for seq in run.seqs() {
                let mut i = 0;
                while i < self.unacked.len() {
                    if self.unacked[i].ty == run.ty && self.unacked[i].seq == seq {
                        let record = self.unacked.swap_remove(i);
                        self.recv_acks.push_back(MessageKey { ty: record.ty, seq: record.seq });
                        record.msg.finish_one(pool);
                        self.stats.acks_recv += 1;
                    } else {
                        i += 1;
                    }
                }
            }
        }
    }

    #[expect(clippy::too_many_arguments, reason = "already-decoded fields of one wire message")]
    fn handle_user(
        &mut self,
        now: Instant,
        ty: MessageType,
        seq: Seq,
        method: DeliveryMethod,
        channel_idx: ChannelIndex,
        frag_pos: Option<FragmentPosition>,
        payload: &[u8],
    ) {
        let full_payload = match frag_pos {
            Some(position) => {
                let max_frag_len = self.config.max_fragment_payload_len();
                let receiver = self.frag_recv.entry(ty).or_default();
                match receiver.reassemble(max_frag_len, &mut self.reassembly_budget, seq, position, payload) {
                    Ok(Some(bytes)) => {
                        // approximates freeing the capacity consumed while
                        // buffering this message's fragments
                        self.reassembly_budget.refill_exact(bytes.len());
                        Some(Bytes::from(bytes))
                    }
                    Ok(None) => None,
                    Err(err) => {
                        warn!("fragment reassembly error from {}: {err}", self.remote_addr);
                        return;
                    }
                }
            }
            None => Some(Bytes::copy_from_slice(payload)),
        };
        let Some(full_payload) = full_payload else {
            return;
        };

        if method.reliability() == Reliability::Reliable {
            self.acks.push(ty, seq, now, self.config.max_ack_delay);
        }

        let channel = self
            .channels
            .get_mut(ty)
            .expect("ty decoded as Kind::User, so the channel table has a slot for it");

        match method {
            DeliveryMethod::Unreliable => self.push_recv(method, channel_idx, full_payload, now),
            DeliveryMethod::UnreliableSequenced | DeliveryMethod::ReliableSequenced => {
                if let SequencedAccept::Accept = channel.on_receive_sequenced(seq) {
                    self.push_recv(method, channel_idx, full_payload, now);
                }
            }
            DeliveryMethod::ReliableUnordered => match channel.on_receive_reliable(seq, false, full_payload) {
                Accept::InOrder(payload) | Accept::EarlyReleased(payload) => {
                    self.push_recv(method, channel_idx, payload, now);
                    // unordered channels never withhold, so this never yields
                    // payloads, but it must run to advance the window and
                    // keep a later retransmit of this sequence a duplicate.
                    for drained in channel.drain_ready() {
                        self.push_recv(method, channel_idx, drained, now);
                    }
                }
                Accept::EarlyWithheld => unreachable!("unordered channels never withhold"),
                Accept::Duplicate => self.stats.msgs_dropped_duplicate += 1,
            },
            DeliveryMethod::ReliableOrdered => match channel.on_receive_reliable(seq, true, full_payload) {
                Accept::InOrder(payload) => {
                    self.push_recv(method, channel_idx, payload, now);
                    for drained in channel.drain_ready() {
                        self.push_recv(method, channel_idx, drained, now);
                    }
                }
                Accept::EarlyWithheld => {}
                Accept::EarlyReleased(_) => unreachable!("ordered channels never release early"),
                Accept::Duplicate => self.stats.msgs_dropped_duplicate += 1,
            },
        }
    }

    fn push_recv(&mut self, method: DeliveryMethod, channel: ChannelIndex, payload: Bytes, recv_at: Instant) {
        self.stats.msgs_recv += 1;
        self.recv_msgs.push_back(RecvMessage { method, channel, payload, recv_at });
    }

    fn record_wire_payload(&self, record: &SendingRecord) -> Bytes {
        match record.frag {
            None => record.msg.payload().clone(),
            Some(position) => {
                let max_frag_len = self.config.max_fragment_payload_len();
                let full = record.msg.payload();
                let start = usize::from(position.index) * max_frag_len;
                let end = (start + max_frag_len).min(full.len());
                full.slice(start..end)
            }
        }
    }

    fn record_wire_len(&self, record: &SendingRecord) -> usize {
        let payload_len = match record.frag {
            None => record.msg.payload().len(),
            Some(position) => {
                let max_frag_len = self.config.max_fragment_payload_len();
                let start = usize::from(position.index) * max_frag_len;
                record.msg.payload().len().saturating_sub(start).min(max_frag_len)
            }
        };
        let frag_overhead = if record.frag.is_some() { FragmentPosition::ENCODE_LEN } else { 0 };
        MessageHeader::ENCODE_LEN + 1 + frag_overhead + payload_len
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::lane::ChannelIndex, std::net::Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 12345))
    }

    struct NullPool;
    impl MessagePool for NullPool {
        fn recycle(&mut self, _msg: OutgoingMessage) {}
    }

    #[test]
    fn connect_starts_in_connecting_status() {
        let now = Instant::now();
        let conn = Connection::connect(addr(), 1, Config::default(), now);
        assert_eq!(Status::Connecting, conn.status());
    }

    #[test]
    fn send_message_rejects_before_connected() {
        let now = Instant::now();
        let mut conn = Connection::connect(addr(), 1, Config::default(), now);
        let err = conn
            .send_message(Bytes::from_static(b"hi"), DeliveryMethod::Unreliable, ChannelIndex(0))
            .unwrap_err();
        assert_eq!(SendError::NotConnected, err);
    }

    #[test]
    fn send_message_rejects_out_of_range_channel() {
        let now = Instant::now();
        let mut config = Config::default();
        config.channels_per_delivery_method = 2;
        let mut conn = Connection::connect(addr(), 1, config, now);
        conn.status = InternalStatus::Connected;
        let err = conn
            .send_message(Bytes::from_static(b"hi"), DeliveryMethod::Unreliable, ChannelIndex(5))
            .unwrap_err();
        assert!(matches!(err, SendError::ChannelOutOfRange { .. }));
    }

    #[test]
    fn approve_clears_pending_approval() {
        let now = Instant::now();
        let mut config = Config::default();
        config.require_approval = true;
        let mut conn = Connection::accept(addr(), 1, config, now);
        assert_eq!(Some(&ConnectionEvent::ApprovalRequested), conn.events.front());
        conn.approve();
        assert_eq!(InternalStatus::RespondedConnect { pending_approval: false }, conn.status);
    }

    #[test]
    fn deny_moves_to_disconnecting() {
        let now = Instant::now();
        let mut config = Config::default();
        config.require_approval = true;
        let mut conn = Connection::accept(addr(), 1, config, now);
        conn.deny("no thanks");
        assert_eq!(InternalStatus::Disconnecting, conn.status);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let now = Instant::now();
        let mut conn = Connection::connect(addr(), 1, Config::default(), now);
        conn.status = InternalStatus::Connected;
        conn.disconnect("bye");
        let unsent_after_first = conn.unsent.len();
        conn.disconnect("bye again");
        assert_eq!(unsent_after_first, conn.unsent.len());
    }

    #[test]
    fn full_handshake_both_sides_reach_connected() {
        let now = Instant::now();
        let config = Config::default();
        let mut initiator = Connection::connect(addr(), 1, config.clone(), now);
        let mut responder = Connection::accept(addr(), 2, config, now);
        let mut pool = NullPool;

        // initiator sends Connect
        let mut buf = Vec::new();
        LibraryMessage::Connect.encode(&mut buf).unwrap();
        let mut header_buf = Vec::new();
        MessageHeader {
            ty: MessageType::LIBRARY,
            seq: Seq(0),
            len: u16::try_from(buf.len()).unwrap(),
        }
        .encode(&mut header_buf)
        .unwrap();
        0u8.encode(&mut header_buf).unwrap();
        header_buf.extend_from_slice(&buf);

        responder.on_packet(now, &header_buf, &mut pool);
        assert_eq!(1, responder.unsent.len());
        let record = responder.unsent.pop_front().unwrap();
        assert_eq!(Some(LibraryMessageType::ConnectResponse), record.msg.lib_type());

        let mut resp_buf = Vec::new();
        LibraryMessage::ConnectResponse.encode(&mut resp_buf).unwrap();
        let mut resp_header = Vec::new();
        MessageHeader {
            ty: MessageType::LIBRARY,
            seq: Seq(0),
            len: u16::try_from(resp_buf.len()).unwrap(),
        }
        .encode(&mut resp_header)
        .unwrap();
        0u8.encode(&mut resp_header).unwrap();
        resp_header.extend_from_slice(&resp_buf);

        initiator.on_packet(now, &resp_header, &mut pool);
        assert_eq!(Status::Connected, initiator.status());
        assert_eq!(1, initiator.unsent.len());
        let established = initiator.unsent.pop_front().unwrap();
        assert_eq!(Some(LibraryMessageType::ConnectionEstablished), established.msg.lib_type());

        let mut est_buf = Vec::new();
        LibraryMessage::ConnectionEstablished.encode(&mut est_buf).unwrap();
        let mut est_header = Vec::new();
        MessageHeader {
            ty: MessageType::LIBRARY,
            seq: Seq(1),
            len: u16::try_from(est_buf.len()).unwrap(),
        }
        .encode(&mut est_header)
        .unwrap();
        0u8.encode(&mut est_header).unwrap();
        est_header.extend_from_slice(&est_buf);

        responder.on_packet(now, &est_header, &mut pool);
        assert_eq!(Status::Connected, responder.status());
    }
}
