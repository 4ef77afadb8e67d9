//! Sequence numbers with modular ordering.

use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// A 32-bit TCP sequence number.
///
/// Arithmetic wraps at 2^32 and `a < b` holds when `a - b` has its sign bit
/// set. Two numbers exactly 2^31 apart are ordered by their raw value so that
/// `a < b` and `b < a` never both hold.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqNumber(u32);

impl SeqNumber {
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether `low <= self <= high` in sequence space.
    pub fn is_between(self, low: Self, high: Self) -> bool {
        low <= self && self <= high
    }
}

impl Ord for SeqNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let diff = self.0.wrapping_sub(other.0);
        if diff == 1 << 31 {
            self.0.cmp(&other.0)
        } else {
            (diff as i32).cmp(&0)
        }
    }
}

impl PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add<u32> for SeqNumber {
    type Output = Self;

    fn add(self, rhs: u32) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SeqNumber {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u32> for SeqNumber {
    fn sub_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

/// The signed distance from `rhs` to `self`.
impl Sub for SeqNumber {
    type Output = i32;

    fn sub(self, rhs: Self) -> i32 {
        self.0.wrapping_sub(rhs.0) as i32
    }
}

impl From<u32> for SeqNumber {
    fn from(n: u32) -> Self {
        Self(n)
    }
}

impl From<SeqNumber> for u32 {
    fn from(seq: SeqNumber) -> Self {
        seq.0
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn s(n: u32) -> SeqNumber {
        SeqNumber::new(n)
    }

    #[test]
    fn modular_comparison() {
        assert!(s(10) < s(20));
        assert!(s(20) > s(10));
        assert!(s(2_000_000_000) < s(3_000_000_000));
        assert!(s(3_000_000_000) < s(4_000_000_000));
        assert!(s(5) <= s(5));
        assert!(!(s(5) < s(5)));
    }

    #[test]
    fn wraparound() {
        assert!(s(0xFFFF_FFFF) < s(1));
        assert!(s(1) > s(0xFFFF_FFFF));
        assert_eq!(s(0xFFFF_FFFF) + 2, s(1));
        assert_eq!(s(1) - s(0xFFFF_FFFF), 2);
        assert_eq!(s(0xFFFF_FFFF) - s(1), -2);
        assert_eq!(s(0) - 1, s(0xFFFF_FFFF));
    }

    #[test]
    fn half_ring_apart_is_still_antisymmetric() {
        let a = s(7);
        let b = s(7 + (1 << 31));
        assert!(a < b);
        assert!(!(b < a));
    }

    #[test]
    fn never_both_less() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        for _ in 0..10_000 {
            let a = s(rng.gen());
            let b = s(rng.gen());
            assert!(!(a < b && b < a), "{a} and {b}");
            assert_eq!(a == b, !(a < b) && !(b < a));
        }
    }

    #[test]
    fn between() {
        assert!(s(5).is_between(s(5), s(5)));
        assert!(s(0).is_between(s(0xFFFF_FFF0), s(10)));
        assert!(!s(11).is_between(s(0xFFFF_FFF0), s(10)));
    }
}
