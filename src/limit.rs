//! See [`Limit`].

use derive_more::{Display, Error};

/// Tracks how many counts a value has remaining, and allows consuming or
/// refilling that counter.
///
/// See [`ByteBucket`].
pub trait Limit {
    /// Value returned by [`Limit::try_consume`].
    type Consume<'this>: Consume
    where
        Self: 'this;

    /// Checks if this value has at least `n` counts remaining, and if so,
    /// provides a value which can be used to consume those counts.
    ///
    /// For regular usage, prefer [`Limit::consume`]. See [`Consume`] for why
    /// this is a separate method.
    ///
    /// # Errors
    ///
    /// Errors if there are fewer than `n` counts left.
    fn try_consume(&mut self, n: usize) -> Result<Self::Consume<'_>, NotEnoughCounts>;

    /// Attempts to consume `n` counts from this.
    ///
    /// # Errors
    ///
    /// Errors if there are fewer than `n` counts left.
    ///
    /// # Examples
    ///
    /// ```
    /// use relnet::limit::{Limit, ByteBucket};
    /// let mut counts = ByteBucket::new(1000);
    /// assert_eq!(1000, counts.cap());
    /// assert_eq!(1000, counts.rem());
    ///
    /// counts.consume(200).unwrap();
    /// assert_eq!(1000, counts.cap());
    /// assert_eq!(800, counts.rem());
    ///
    /// counts.consume(900).unwrap_err();
    /// ```
    fn consume(&mut self, n: usize) -> Result<(), NotEnoughCounts> {
        self.try_consume(n).map(Consume::consume)
    }

    /// Creates a new [`Limit`] which takes the smallest amount of counts from
    /// between `self` and `other`.
    ///
    /// If either side doesn't have `n` counts left, counts are consumed from
    /// neither.
    ///
    /// # Examples
    ///
    /// ```
    /// use relnet::limit::{Limit, ByteBucket};
    /// let counts1 = ByteBucket::new(1000);
    /// let counts2 = ByteBucket::new(500);
    /// let mut min_of = counts1.min_of(counts2);
    ///
    /// min_of.consume(500).unwrap();
    /// min_of.consume(1).unwrap_err();
    /// ```
    fn min_of<B>(self, other: B) -> MinOf<Self, B>
    where
        Self: Sized,
    {
        MinOf { a: self, b: other }
    }
}

impl<T: Limit> Limit for &mut T {
    type Consume<'this>
        = T::Consume<'this>
    where
        Self: 'this;

    #[inline]
    fn try_consume(&mut self, n: usize) -> Result<Self::Consume<'_>, NotEnoughCounts> {
        T::try_consume(self, n)
    }
}

/// There were not enough counts available to consume from a [`Limit`].
#[derive(Debug, Clone, Copy, Display, Error)]
#[display("not enough counts")]
pub struct NotEnoughCounts;

/// Allows consuming counts from a [`Limit`] after they have already been
/// checked to be available.
///
/// This exists so that [`MinOf`] can check both sides have enough counts
/// before committing to consuming from either:
///
/// ```ignore
/// let consume_a = self.a.try_consume(n)?;
/// let consume_b = self.b.try_consume(n)?;
/// Ok(ConsumeMinOf { consume_a, consume_b })
/// ```
///
/// If either side lacks enough counts, `?` bails before anything is
/// consumed.
pub trait Consume {
    /// Consumes the counts that were checked by [`Limit::try_consume`].
    fn consume(self);
}

impl Limit for usize {
    type Consume<'this> = ConsumeImpl<'this>;

    #[inline]
    fn try_consume(&mut self, n: usize) -> Result<Self::Consume<'_>, NotEnoughCounts> {
        if *self >= n {
            Ok(ConsumeImpl { rem: self, n })
        } else {
            Err(NotEnoughCounts)
        }
    }

    #[inline]
    fn consume(&mut self, n: usize) -> Result<(), NotEnoughCounts> {
        *self = self.checked_sub(n).ok_or(NotEnoughCounts)?;
        Ok(())
    }
}

/// Output of [`Limit::try_consume`] for [`usize`] and [`ByteBucket`].
#[derive(Debug)]
pub struct ConsumeImpl<'a> {
    rem: &'a mut usize,
    n: usize,
}

impl Consume for ConsumeImpl<'_> {
    #[inline]
    fn consume(self) {
        *self.rem -= self.n;
    }
}

/// Tracks how many bytes of budget remain in a [token bucket], consumed as
/// data is sent and refilled on a schedule.
///
/// Used both for the heartbeat engine's throttle debt accounting and the
/// fragmentation assembler's per-connection reassembly memory cap: both are
/// "track a remaining count, consume before writing, refill on a schedule"
/// so they share this one abstraction.
///
/// [token bucket]: https://en.wikipedia.org/wiki/Token_bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteBucket {
    cap: usize,
    rem: usize,
}

impl ByteBucket {
    /// Creates a new bucket with the given constant capacity, starting full.
    #[must_use]
    pub const fn new(cap: usize) -> Self {
        Self { cap, rem: cap }
    }

    /// Gets the maximum number of bytes in this bucket.
    #[must_use]
    pub const fn cap(&self) -> usize {
        self.cap
    }

    /// Gets the number of bytes remaining.
    #[must_use]
    pub const fn rem(&self) -> usize {
        self.rem
    }

    /// Gets the number of bytes used, equivalent to `cap - rem`.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.cap - self.rem
    }

    /// Refills this bucket to its maximum capacity.
    #[inline]
    pub const fn refill(&mut self) {
        self.rem = self.cap;
    }

    /// Refills this bucket by an exact amount, capped at capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use relnet::limit::{Limit, ByteBucket};
    /// let mut counts = ByteBucket::new(1000);
    /// counts.consume(500).unwrap();
    /// counts.refill_exact(100);
    /// assert_eq!(600, counts.rem());
    /// counts.refill_exact(1000);
    /// assert_eq!(1000, counts.rem());
    /// ```
    pub fn refill_exact(&mut self, n: usize) {
        self.rem = self.cap.min(self.rem.saturating_add(n));
    }

    /// Refills this bucket by bytes-per-second times the elapsed seconds
    /// since the last refill, capped at capacity. This is how throttle
    /// debt decays between heartbeat invocations.
    ///
    /// # Panics
    ///
    /// Panics if `elapsed_secs` is negative.
    pub fn refill_rate(&mut self, bytes_per_sec: f64, elapsed_secs: f64) {
        assert!(elapsed_secs >= 0.0, "elapsed_secs = {elapsed_secs}");
        #[expect(clippy::cast_sign_loss, reason = "inputs are non-negative")]
        #[expect(clippy::cast_possible_truncation, reason = "truncation is acceptable")]
        let n = (bytes_per_sec * elapsed_secs) as usize;
        self.refill_exact(n);
    }

    /// Updates the maximum number of bytes in this bucket, potentially
    /// reducing the number of bytes currently available.
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap;
        self.rem = self.rem.min(cap);
    }
}

impl Limit for ByteBucket {
    type Consume<'this> = ConsumeImpl<'this>;

    #[inline]
    fn try_consume(&mut self, n: usize) -> Result<Self::Consume<'_>, NotEnoughCounts> {
        if self.rem >= n {
            Ok(ConsumeImpl {
                rem: &mut self.rem,
                n,
            })
        } else {
            Err(NotEnoughCounts)
        }
    }

    #[inline]
    fn consume(&mut self, n: usize) -> Result<(), NotEnoughCounts> {
        self.rem = self.rem.checked_sub(n).ok_or(NotEnoughCounts)?;
        Ok(())
    }
}

/// [`Limit`] which attempts to consume from both `A` and `B`.
///
/// Use [`Limit::min_of`] to create one.
#[derive(Debug, Clone)]
pub struct MinOf<A, B> {
    a: A,
    b: B,
}

impl<A, B> MinOf<A, B> {
    /// Gets the inner values wrapped in this value.
    #[inline]
    pub fn into_inner(self) -> (A, B) {
        (self.a, self.b)
    }
}

impl<A: Limit, B: Limit> Limit for MinOf<A, B> {
    type Consume<'s>
        = ConsumeMinOf<A::Consume<'s>, B::Consume<'s>>
    where
        Self: 's;

    #[inline]
    fn try_consume(&mut self, n: usize) -> Result<Self::Consume<'_>, NotEnoughCounts> {
        let consume_a = self.a.try_consume(n)?;
        let consume_b = self.b.try_consume(n)?;
        Ok(ConsumeMinOf {
            consume_a,
            consume_b,
        })
    }
}

/// Output of [`MinOf::try_consume`].
#[derive(Debug)]
pub struct ConsumeMinOf<A, B> {
    consume_a: A,
    consume_b: B,
}

impl<A: Consume, B: Consume> Consume for ConsumeMinOf<A, B> {
    #[inline]
    fn consume(self) {
        self.consume_a.consume();
        self.consume_b.consume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_usize_max() {
        let mut counts = ByteBucket::new(usize::MAX);
        counts.refill_exact(1);
        assert_eq!(usize::MAX, counts.rem());
        counts.refill_exact(usize::MAX);
        assert_eq!(usize::MAX, counts.rem());
    }

    #[test]
    fn min_of_all_or_nothing() {
        let a = ByteBucket::new(10);
        let b = ByteBucket::new(5);
        let mut min_of = a.min_of(b);
        min_of.consume(5).unwrap();
        let (a, b) = min_of.into_inner();
        assert_eq!(5, a.rem());
        assert_eq!(0, b.rem());
    }

    #[test]
    fn min_of_rejects_partial_consume() {
        let a = ByteBucket::new(10);
        let b = ByteBucket::new(5);
        let mut min_of = a.min_of(b);
        assert!(min_of.consume(6).is_err());
        let (a, b) = min_of.into_inner();
        // neither side should have been touched
        assert_eq!(10, a.rem());
        assert_eq!(5, b.rem());
    }
}
