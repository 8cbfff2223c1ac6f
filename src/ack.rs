//! Outbound acknowledgement accumulation.
//!
//! Every accepted (or duplicate) reliable message queues an ack here; the
//! Heartbeat Engine piggybacks as many pending acks as fit onto outgoing
//! packets, encoding runs of consecutive sequence numbers on the same
//! [`MessageType`] as a single [`crate::library::AckRun`] (see §6/§9 of the
//! design notes for why runs of 3+ consecutive sequence numbers are worth
//! collapsing).

use {
    crate::{library::AckRun, message::MessageType, seq::Seq},
    std::time::{Duration, Instant},
};

/// Accumulates `(type, seq)` pairs awaiting acknowledgement to the peer.
#[derive(Debug, Default)]
pub struct AckQueue {
    pending: Vec<(MessageType, Seq)>,
    force_flush_at: Option<Instant>,
}

impl AckQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if there are no pending acks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queues an ack for `(ty, seq)`.
    ///
    /// If this is the first pending ack since the queue was last drained
    /// empty, sets a forced-flush deadline `max_ack_delay` from `now`, so a
    /// lightly loaded channel still acks within bounded time even with no
    /// other outgoing traffic to piggyback on.
    pub fn push(&mut self, ty: MessageType, seq: Seq, now: Instant, max_ack_delay: Duration) {
        if self.pending.is_empty() {
            self.force_flush_at = Some(now + max_ack_delay);
        }
        self.pending.push((ty, seq));
    }

    /// Returns `true` if the forced-flush deadline has elapsed, meaning the
    /// Heartbeat Engine should flush acks even without other traffic to
    /// piggyback on.
    #[must_use]
    pub fn should_force_flush(&self, now: Instant) -> bool {
        self.force_flush_at.is_some_and(|deadline| now >= deadline)
    }

    /// Builds run-length-encoded [`AckRun`]s from every currently pending
    /// ack, consuming the queue and clearing the forced-flush deadline.
    ///
    /// Consecutive sequence numbers on the same [`MessageType`] are merged
    /// into a single run; a run covers at most 256 sequence numbers (the
    /// wire field is a `u8` count minus one).
    #[must_use]
    pub fn drain_runs(&mut self) -> Vec<AckRun> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        self.force_flush_at = None;

        let mut entries = std::mem::take(&mut self.pending);
        entries.sort_unstable_by_key(|&(ty, seq)| (ty.0, seq.0));
        entries.dedup();

        let mut runs = Vec::new();
        let mut iter = entries.into_iter();
        let Some((mut run_ty, mut run_start)) = iter.next() else {
            return runs;
        };
        let mut run_len: u16 = 1;
        let mut run_next = run_start + Seq(1);

        for (ty, seq) in iter {
            if ty == run_ty && seq == run_next && run_len < 256 {
                run_len += 1;
                run_next += Seq(1);
            } else {
                runs.push(make_run(run_ty, run_start, run_len));
                run_ty = ty;
                run_start = seq;
                run_len = 1;
                run_next = seq + Seq(1);
            }
        }
        runs.push(make_run(run_ty, run_start, run_len));
        runs
    }
}

fn make_run(ty: MessageType, start: Seq, len: u16) -> AckRun {
    debug_assert!((1..=256).contains(&len));
    #[expect(clippy::cast_possible_truncation, reason = "len <= 256, fits after -1")]
    let run_len_minus_one = (len - 1) as u8;
    AckRun {
        ty,
        start_seq: start,
        run_len_minus_one,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DURATION: Duration = Duration::from_millis(100);

    #[test]
    fn empty_queue_drains_nothing() {
        let mut queue = AckQueue::new();
        assert!(queue.drain_runs().is_empty());
    }

    #[test]
    fn merges_consecutive_same_type() {
        let mut queue = AckQueue::new();
        let now = Instant::now();
        for seq in [1u16, 2, 3, 5, 6] {
            queue.push(MessageType(1), Seq(seq), now, DURATION);
        }
        let runs = queue.drain_runs();
        assert_eq!(
            vec![
                AckRun {
                    ty: MessageType(1),
                    start_seq: Seq(1),
                    run_len_minus_one: 2,
                },
                AckRun {
                    ty: MessageType(1),
                    start_seq: Seq(5),
                    run_len_minus_one: 1,
                },
            ],
            runs
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn different_types_are_not_merged() {
        let mut queue = AckQueue::new();
        let now = Instant::now();
        queue.push(MessageType(1), Seq(1), now, DURATION);
        queue.push(MessageType(2), Seq(2), now, DURATION);
        let runs = queue.drain_runs();
        assert_eq!(2, runs.len());
    }

    #[test]
    fn duplicate_acks_are_deduped() {
        let mut queue = AckQueue::new();
        let now = Instant::now();
        queue.push(MessageType(1), Seq(1), now, DURATION);
        queue.push(MessageType(1), Seq(1), now, DURATION);
        let runs = queue.drain_runs();
        assert_eq!(1, runs.len());
        assert_eq!(0, runs[0].run_len_minus_one);
    }

    #[test]
    fn force_flush_deadline_set_on_first_push_only() {
        let mut queue = AckQueue::new();
        let t0 = Instant::now();
        assert!(!queue.should_force_flush(t0));
        queue.push(MessageType(0), Seq(1), t0, DURATION);
        assert!(!queue.should_force_flush(t0));
        assert!(queue.should_force_flush(t0 + DURATION));
    }
}
