//! The Heartbeat Engine: [`Connection::heartbeat`].
//!
//! Invoked by the caller on a fixed schedule ([`Config::heartbeat_interval`]),
//! this drives every time-based piece of the protocol that isn't triggered by
//! an inbound packet: throttle refill, handshake retries, the unacked-sends
//! resend scan, keep-alive/ping scheduling, and the send pipeline itself
//! (draining [`Connection`]'s unsent queue into MTU-sized packets, with
//! optional coalescing, fragmentation-aware framing, and piggybacked acks).
//!
//! Every third invocation performs "greater work" - the timeout check,
//! handshake retries, and resend scan - so those don't run on every single
//! tick of what is typically a 50ms schedule.

use super::*;

impl Connection {
    /// Advances this connection by one heartbeat tick.
    ///
    /// Refills throttle debt, performs greater work every third invocation,
    /// then drains as much of the unsent queue as the throttle budget and
    /// MTU allow into packets handed to `sink`. A [`ConnectionReset`] from
    /// `sink` triggers an immediate local disconnect rather than propagating.
    pub fn heartbeat(&mut self, now: Instant, sink: &mut impl PacketSink, pool: &mut impl MessagePool) {
        self.heartbeat_tick = self.heartbeat_tick.wrapping_add(1);
        if self.heartbeat_tick % GREATER_WORK_PERIOD == 0 {
            self.greater_work(now);
        }
        self.update_throttle(now);

        if matches!(self.status, InternalStatus::Disconnected) {
            return;
        }

        if let Err(ConnectionReset) = self.send_pipeline(now, sink, pool) {
            self.transition_disconnected("connection reset".to_owned());
        }
    }

    fn greater_work(&mut self, now: Instant) {
        if matches!(self.status, InternalStatus::Disconnected) {
            return;
        }
        if now.saturating_duration_since(self.last_heard_from) > self.config.timeout {
            self.transition_disconnected("timed out".to_owned());
            return;
        }

        self.handshake_retry(now);
        self.resend_scan(now);

        let ping_period = self.config.timeout / PING_PERIOD_DIVISOR;
        if matches!(self.status, InternalStatus::Connected) {
            if now >= self.next_keepalive_due {
                if self.unsent.is_empty() && self.acks.is_empty() {
                    self.enqueue_library(LibraryMessage::KeepAlive);
                }
                self.next_keepalive_due = now + ping_period;
            }
            if now >= self.next_ping_due && self.ping_sent_at.is_none() {
                let ping_id = self.next_ping_id();
                self.enqueue_library(LibraryMessage::Ping(PingPayload { ping_id }));
                self.ping_sent_at = Some((ping_id, now));
                self.next_ping_due = now + ping_period;
            }
        }
    }

    fn handshake_retry(&mut self, now: Instant) {
        let is_retryable = matches!(
            self.status,
            InternalStatus::InitiatedConnect | InternalStatus::RespondedConnect { pending_approval: false }
        );
        if !is_retryable {
            return;
        }
        let due = self.handshake_next_attempt_at.is_none_or(|deadline| now >= deadline);
        if !due {
            return;
        }
        if self.handshake_attempts >= self.config.handshake_max_attempts {
            self.transition_disconnected("failed to complete handshake".to_owned());
            return;
        }

        match self.status {
            InternalStatus::InitiatedConnect => self.enqueue_library(LibraryMessage::Connect),
            InternalStatus::RespondedConnect { .. } => self.enqueue_library(LibraryMessage::ConnectResponse),
            _ => unreachable!("checked above"),
        }
        self.handshake_attempts += 1;
        self.handshake_next_attempt_at = Some(now + self.config.handshake_attempt_delay);
    }

    fn resend_scan(&mut self, now: Instant) {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.unacked.len() {
            if self.unacked[i].next_resend.is_some_and(|deadline| now >= deadline) {
                due.push(self.unacked.swap_remove(i));
            } else {
                i += 1;
            }
        }
        for mut record in due {
            record.set_next_resend(now, &self.rtt);
            self.unsent.push_front(record);
        }
    }

    fn update_throttle(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick_at).as_secs_f64();
        self.last_tick_at = now;
        if self.config.throttle_bytes_per_second <= 0.0 {
            self.send_budget.refill();
        } else {
            self.send_budget.refill_rate(self.config.throttle_bytes_per_second, elapsed);
        }
    }

    fn send_pipeline(&mut self, now: Instant, sink: &mut impl PacketSink, pool: &mut impl MessagePool) -> Result<(), ConnectionReset> {
        let mtu = self.config.max_transmission_unit;
        let mut buf = Vec::with_capacity(mtu);

        while let Some(record) = self.unsent.pop_front() {
            let wire_len = self.record_wire_len(&record);
            if wire_len > mtu {
                warn!("dropping record that cannot fit in a single MTU ({wire_len} > {mtu})");
                continue;
            }

            if !buf.is_empty() && (buf.len() + wire_len > mtu || !self.config.use_message_coalescing) {
                self.flush_buf(&mut buf, sink)?;
            }

            if self.send_budget.consume(wire_len).is_err() {
                self.unsent.push_front(record);
                break;
            }

            let is_disconnect = record.msg.lib_type() == Some(LibraryMessageType::Disconnect);
            self.encode_record(&record, &mut buf);
            self.stats.msgs_sent += 1;
            self.finish_or_track(record, now, pool);

            let remaining = mtu.saturating_sub(buf.len());
            if !self.acks.is_empty() {
                self.append_acks(&mut buf, remaining, now);
            }

            if is_disconnect {
                self.flush_buf(&mut buf, sink)?;
                let reason = self.pending_disconnect_reason.take().unwrap_or_default();
                self.transition_disconnected(reason);
                return Ok(());
            }
        }

        if !buf.is_empty() {
            self.flush_buf(&mut buf, sink)?;
        } else if self.acks.should_force_flush(now) {
            let mut ack_buf = Vec::new();
            self.append_acks(&mut ack_buf, mtu, now);
            if !ack_buf.is_empty() {
                self.flush_buf(&mut ack_buf, sink)?;
            }
        }
        Ok(())
    }

    fn finish_or_track(&mut self, mut record: SendingRecord, now: Instant, pool: &mut impl MessagePool) {
        let is_reliable = record
            .ty
            .decode_kind(self.config.channels_per_delivery_method)
            .is_some_and(|kind| matches!(kind, Kind::User(method, _) if method.reliability() == Reliability::Reliable));
        if is_reliable {
            record.set_next_resend(now, &self.rtt);
            self.unacked.push(record);
        } else {
            record.msg.finish_one(pool);
        }
    }

    fn encode_record(&self, record: &SendingRecord, buf: &mut Vec<u8>) {
        let payload = self.record_wire_payload(record);
        #[expect(clippy::cast_possible_truncation, reason = "payload len is bounded by the MTU")]
        let len = payload.len() as u16;
        let header = MessageHeader { ty: record.ty, seq: record.seq, len };
        header.encode(&mut *buf).expect("encoding into a Vec never fails");
        let has_frag: u8 = u8::from(record.frag.is_some());
        has_frag.encode(&mut *buf).expect("encoding into a Vec never fails");
        if let Some(position) = record.frag {
            position.encode(&mut *buf).expect("encoding into a Vec never fails");
        }
        buf.extend_from_slice(&payload);
    }

    fn append_acks(&mut self, buf: &mut Vec<u8>, remaining: usize, now: Instant) {
        // header + frag-flag byte + library discriminant byte + the
        // AcknowledgePayload's own run-count byte
        let fixed_overhead = MessageHeader::ENCODE_LEN + 1 + 1 + 1;
        if remaining <= fixed_overhead {
            return;
        }
        let max_runs = (remaining - fixed_overhead) / crate::library::AckRun::ENCODE_LEN;
        if max_runs == 0 {
            return;
        }

        let mut runs = self.acks.drain_runs();
        if runs.is_empty() {
            return;
        }
        if runs.len() > max_runs {
            for overflow_run in runs.split_off(max_runs) {
                for seq in overflow_run.seqs() {
                    self.acks.push(overflow_run.ty, seq, now, self.config.max_ack_delay);
                }
            }
        }
        let sent_count = runs.iter().map(|run| u64::from(run.len())).sum::<u64>();

        let lib_msg = LibraryMessage::Acknowledge(AcknowledgePayload { runs });
        let mut payload_buf = Vec::new();
        lib_msg.encode(&mut payload_buf).expect("encoding into a Vec never fails");

        #[expect(clippy::cast_possible_truncation, reason = "bounded by remaining MTU space")]
        let len = payload_buf.len() as u16;
        let seq = self.lib_send_seq;
        self.lib_send_seq += Seq(1);
        let header = MessageHeader { ty: MessageType::LIBRARY, seq, len };
        header.encode(&mut *buf).expect("encoding into a Vec never fails");
        0u8.encode(&mut *buf).expect("encoding into a Vec never fails");
        buf.extend_from_slice(&payload_buf);
        self.stats.acks_sent += sent_count;
    }

    fn flush_buf(&mut self, buf: &mut Vec<u8>, sink: &mut impl PacketSink) -> Result<(), ConnectionReset> {
        if buf.is_empty() {
            return Ok(());
        }
        sink.send_packet(buf, self.remote_addr)?;
        self.stats.packets_sent += 1;
        buf.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::lane::ChannelIndex,
        std::{cell::RefCell, net::Ipv4Addr, rc::Rc},
    };

    fn addr() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 23456))
    }

    struct NullPool;
    impl MessagePool for NullPool {
        fn recycle(&mut self, _msg: OutgoingMessage) {}
    }

    #[derive(Default, Clone)]
    struct RecordingSink {
        packets: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl PacketSink for RecordingSink {
        fn send_packet(&mut self, payload: &[u8], _to: SocketAddr) -> Result<(), ConnectionReset> {
            self.packets.borrow_mut().push(payload.to_vec());
            Ok(())
        }
    }

    struct AlwaysResetSink;
    impl PacketSink for AlwaysResetSink {
        fn send_packet(&mut self, _payload: &[u8], _to: SocketAddr) -> Result<(), ConnectionReset> {
            Err(ConnectionReset)
        }
    }

    fn tick(conn: &mut Connection, now: &mut Instant, sink: &mut impl PacketSink, pool: &mut impl MessagePool, interval: std::time::Duration) {
        *now += interval;
        conn.heartbeat(*now, sink, pool);
    }

    #[test]
    fn initiator_sends_connect_on_greater_work_tick() {
        let mut now = Instant::now();
        let config = Config::default();
        let mut conn = Connection::connect(addr(), 1, config.clone(), now);
        let mut sink = RecordingSink::default();
        let mut pool = NullPool;

        for _ in 0..GREATER_WORK_PERIOD {
            tick(&mut conn, &mut now, &mut sink, &mut pool, config.heartbeat_interval);
        }

        assert_eq!(1, sink.packets.borrow().len());
    }

    #[test]
    fn connection_reset_triggers_local_disconnect() {
        let mut now = Instant::now();
        let config = Config::default();
        let mut conn = Connection::connect(addr(), 1, config.clone(), now);
        conn.status = InternalStatus::Connected;
        conn.enqueue_library(LibraryMessage::KeepAlive);
        let mut sink = AlwaysResetSink;
        let mut pool = NullPool;

        tick(&mut conn, &mut now, &mut sink, &mut pool, config.heartbeat_interval);

        assert_eq!(Status::Disconnected, conn.status());
    }

    #[test]
    fn unreliable_send_finishes_immediately_after_one_transmission() {
        let mut now = Instant::now();
        let config = Config::default();
        let mut conn = Connection::connect(addr(), 1, config, now);
        conn.status = InternalStatus::Connected;
        conn.send_message(Bytes::from_static(b"hi"), DeliveryMethod::Unreliable, ChannelIndex(0))
            .unwrap();

        let mut sink = RecordingSink::default();
        let mut pool = NullPool;
        now += std::time::Duration::from_millis(50);
        conn.heartbeat(now, &mut sink, &mut pool);

        assert_eq!(1, sink.packets.borrow().len());
        assert!(conn.unacked.is_empty());
    }

    #[test]
    fn reliable_send_is_tracked_until_acked() {
        let mut now = Instant::now();
        let config = Config::default();
        let mut conn = Connection::connect(addr(), 1, config, now);
        conn.status = InternalStatus::Connected;
        conn.send_message(Bytes::from_static(b"hi"), DeliveryMethod::ReliableOrdered, ChannelIndex(0))
            .unwrap();

        let mut sink = RecordingSink::default();
        let mut pool = NullPool;
        now += std::time::Duration::from_millis(50);
        conn.heartbeat(now, &mut sink, &mut pool);

        assert_eq!(1, sink.packets.borrow().len());
        assert_eq!(1, conn.unacked.len());
    }

    #[test]
    fn throttle_defers_sends_past_peak_budget() {
        let mut now = Instant::now();
        let mut config = Config::default();
        config.throttle_peak_bytes = 8;
        let mut conn = Connection::connect(addr(), 1, config, now);
        conn.status = InternalStatus::Connected;
        conn.send_message(Bytes::from_static(b"a long enough payload to exceed the tiny budget"), DeliveryMethod::Unreliable, ChannelIndex(0))
            .unwrap();

        let mut sink = RecordingSink::default();
        let mut pool = NullPool;
        now += std::time::Duration::from_millis(50);
        conn.heartbeat(now, &mut sink, &mut pool);

        assert!(sink.packets.borrow().is_empty());
        assert_eq!(1, conn.unsent.len());
    }
}
