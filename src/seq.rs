//! See [`Seq`].

use {
    core::{
        cmp::Ordering,
        fmt,
        ops::{Add, AddAssign, Sub, SubAssign},
    },
    octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write},
};

/// 16-bit sequence number with wraparound-aware ordering.
///
/// A sequence number identifies a single message or packet sent over the
/// network, within some scope (a sender, a channel). Since only 16 bits are
/// used, the number will wrap around fairly quickly if messages are sent at
/// a high rate, so all comparisons must take wraparound into account instead
/// of comparing the raw integers.
///
/// The sequence number can be visualized as an infinite number line, where
/// [`u16::MAX`] is right before `0`, `0` is before `1`, etc.:
///
/// ```text
///     65534  65535    0      1      2
/// ... --|------|------|------|------|-- ...
/// ```
///
/// [Addition](Add) and [subtraction](Sub) always wrap.
///
/// See <https://gafferongames.com/post/reliability_ordering_and_congestion_avoidance_over_udp/>,
/// *Handling Sequence Number Wrap-Around*.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Seq(pub u16);

impl Seq {
    /// Computes `relate(self, rhs)`: a signed distance from `rhs` to `self`
    /// that accounts for wraparound, in the range `-32768..=32767`.
    ///
    /// A positive result means `rhs` is ahead of `self`; a negative result
    /// means `rhs` is behind `self`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use relnet::seq::Seq;
    /// assert_eq!(Seq(0).dist_to(Seq(0)), 0);
    /// assert_eq!(Seq(0).dist_to(Seq(5)), 5);
    /// assert_eq!(Seq(5).dist_to(Seq(0)), -5);
    /// assert_eq!(Seq(u16::MAX).dist_to(Seq(0)), 1);
    /// assert_eq!(Seq(0).dist_to(Seq(u16::MAX)), -1);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        #[expect(clippy::cast_possible_wrap, reason = "we want wrap behavior")]
        (rhs.0.wrapping_sub(self.0) as i16)
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Seq").field(&self.0).finish()
    }
}

impl Ord for Seq {
    /// Compares `self` to `other` respecting wraparound, treating e.g.
    /// `0 cmp 1` as [`Less`](Ordering::Less), but `0 cmp 65535` as
    /// [`Greater`](Ordering::Greater).
    ///
    /// If the real difference between the two values is `u16::MAX / 2` or
    /// larger, no particular ordering is guaranteed.
    fn cmp(&self, other: &Self) -> Ordering {
        let s1 = self.0;
        let s2 = other.0;
        #[expect(clippy::cast_possible_wrap, reason = "we want wrap behavior")]
        (s1 as i16).wrapping_sub(s2 as i16).cmp(&0)
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for Seq {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Seq {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Seq {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Seq {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl FixedEncodeLen for Seq {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for Seq {
    type Error = core::convert::Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for Seq {
    type Error = core::convert::Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

/// Relates two sequence numbers, returning how far ahead `a` is of `b`.
///
/// `relate(a, b) == 0` means equal. A result in `1..=i16::MAX` means `a` is
/// ahead of `b` by that many. A result in `i16::MIN..=-1` means `a` is
/// behind `b`. This is the primitive all sequence comparisons in this crate
/// are built from; nothing compares raw `u16`s directly.
#[must_use]
pub const fn relate(a: Seq, b: Seq) -> i16 {
    #[expect(clippy::cast_possible_wrap, reason = "we want wrap behavior")]
    (a.0 as i16).wrapping_sub(b.0 as i16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_all_seqs() {
        use octs::test::hint_round_trip;
        for seq in 0..u16::MAX {
            hint_round_trip(&Seq(seq));
        }
    }

    #[test]
    fn relate_equal() {
        assert_eq!(relate(Seq(5), Seq(5)), 0);
        assert_eq!(relate(Seq(0), Seq(0)), 0);
    }

    #[test]
    fn relate_ahead() {
        assert_eq!(relate(Seq(1), Seq(0)), 1);
        assert_eq!(relate(Seq(0), Seq(u16::MAX)), 1);
    }

    #[test]
    fn relate_behind() {
        assert_eq!(relate(Seq(0), Seq(1)), -1);
        assert_eq!(relate(Seq(u16::MAX), Seq(0)), -1);
    }

    #[test]
    fn increasing_wraparound() {
        assert!(Seq(0) < Seq(1));
        assert!(Seq(1) < Seq(2));
        assert!(Seq(u16::MAX - 1) < Seq(u16::MAX));
        assert!(Seq(u16::MAX) < Seq(0));
        assert!(Seq(u16::MAX) < Seq(1));
        assert!(Seq(u16::MAX - 3) < Seq(2));

        // difference around u16::MAX / 2 is intentionally untested: no
        // ordering is guaranteed there
    }
}
