//! Key hash ranges.
//!
//! A range is the interval of ring positions a node owns. Both endpoints are
//! inclusive. When `start > end` the range wraps past `HashKey::MAX` and
//! covers `[start, MAX] ∪ [MIN, end]`.

use crate::hash::{HashKey, HASH_KEY_BYTES};
use serde::Serialize;
use std::fmt;

/// An interval of ownership on the ring, possibly wrapping around.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct KeyHashRange {
    pub start: HashKey,
    pub end: HashKey,
}

impl KeyHashRange {
    pub fn new(start: HashKey, end: HashKey) -> Self {
        Self { start, end }
    }

    /// The range covering the whole ring without wrapping.
    pub fn full() -> Self {
        Self::new(HashKey::MIN, HashKey::MAX)
    }

    /// The range a node at `own` owns when its predecessor sits at `predecessor`.
    ///
    /// With a single member `predecessor == own`, which yields the full ring.
    pub fn owned_by(predecessor: HashKey, own: HashKey) -> Self {
        Self::new(predecessor.next(), own)
    }

    pub fn is_wrapped_around(&self) -> bool {
        self.start > self.end
    }

    /// True when every position on the ring is covered.
    pub fn is_full(&self) -> bool {
        self.start == self.end.next()
    }

    pub fn contains(&self, key: HashKey) -> bool {
        if self.is_wrapped_around() {
            key >= self.start || key <= self.end
        } else {
            self.start <= key && key <= self.end
        }
    }

    /// The non-wrapping pieces of this range, in ring order from `start`.
    ///
    /// A wrapped range splits into `[start, MAX]` and `[MIN, end]`; anything
    /// else is returned as-is.
    pub fn segments(&self) -> Vec<KeyHashRange> {
        if self.is_wrapped_around() {
            vec![
                KeyHashRange::new(self.start, HashKey::MAX),
                KeyHashRange::new(HashKey::MIN, self.end),
            ]
        } else {
            vec![*self]
        }
    }

    /// True when every key in `self` is also in `other`.
    ///
    /// Each linear segment of `self` has to fit inside a single segment of
    /// `other`: two segments of a non-full range never touch on the number
    /// line, so no linear segment can straddle them.
    pub fn is_sub_range_of(&self, other: &KeyHashRange) -> bool {
        if other.is_full() {
            return true;
        }
        let theirs = other.segments();
        self.segments().iter().all(|mine| {
            theirs
                .iter()
                .any(|t| t.start <= mine.start && mine.end <= t.end)
        })
    }

    pub fn start_bytes(&self) -> [u8; HASH_KEY_BYTES] {
        self.start.to_bytes()
    }

    pub fn end_bytes(&self) -> [u8; HASH_KEY_BYTES] {
        self.end.to_bytes()
    }
}

impl fmt::Display for KeyHashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn r(start: u128, end: u128) -> KeyHashRange {
        KeyHashRange::new(HashKey(start), HashKey(end))
    }

    #[test]
    fn test_contains_plain() {
        let range = r(10, 20);
        assert!(!range.is_wrapped_around());
        assert!(range.contains(HashKey(10)));
        assert!(range.contains(HashKey(20)));
        assert!(!range.contains(HashKey(9)));
        assert!(!range.contains(HashKey(21)));
    }

    #[test]
    fn test_contains_wrapped() {
        let range = r(u128::MAX - 5, 5);
        assert!(range.is_wrapped_around());
        assert!(range.contains(HashKey::MAX));
        assert!(range.contains(HashKey::MIN));
        assert!(range.contains(HashKey(5)));
        assert!(!range.contains(HashKey(6)));
        assert!(!range.contains(HashKey(u128::MAX - 6)));
    }

    #[test]
    fn test_single_member_owns_everything() {
        let own = HashKey(1234);
        let range = KeyHashRange::owned_by(own, own);
        assert!(range.is_full());
        assert!(range.contains(HashKey::MIN));
        assert!(range.contains(HashKey::MAX));
        assert!(range.contains(own));
        assert!(KeyHashRange::full().is_full());
    }

    #[test]
    fn test_sub_range() {
        assert!(r(12, 15).is_sub_range_of(&r(10, 20)));
        assert!(!r(5, 15).is_sub_range_of(&r(10, 20)));
        assert!(r(u128::MAX - 1, 1).is_sub_range_of(&r(u128::MAX - 5, 5)));
        assert!(r(2, 4).is_sub_range_of(&r(u128::MAX - 5, 5)));
        assert!(!r(4, 6).is_sub_range_of(&r(u128::MAX - 5, 5)));
        // A plain range cannot hold a wrapped one.
        assert!(!r(u128::MAX - 1, 1).is_sub_range_of(&r(0, u128::MAX - 1)));
        assert!(r(u128::MAX - 1, 1).is_sub_range_of(&KeyHashRange::owned_by(HashKey(7), HashKey(7))));
    }

    #[test]
    fn test_segments() {
        assert_eq!(r(3, 9).segments(), vec![r(3, 9)]);
        assert_eq!(r(9, 3).segments(), vec![r(9, u128::MAX), r(0, 3)]);
    }

    /// Reference membership test over the effective key set: walk clockwise
    /// from `start` to `end`.
    fn covers(start: u128, end: u128, key: u128) -> bool {
        key.wrapping_sub(start) <= end.wrapping_sub(start)
    }

    proptest! {
        #[test]
        fn prop_contains_matches_clockwise_walk(a: u128, b: u128, k: u128) {
            prop_assert_eq!(r(a, b).contains(HashKey(k)), covers(a, b, k));
        }

        #[test]
        fn prop_contains_agrees_with_segments(a: u128, b: u128, k: u128) {
            let range = r(a, b);
            let in_segments = range.segments().iter().any(|s| s.start.0 <= k && k <= s.end.0);
            prop_assert_eq!(range.contains(HashKey(k)), in_segments);
        }

        /// The same effective key set, written as one wrapped range or as
        /// its two plain pieces, must answer sub-range queries identically.
        #[test]
        fn prop_sub_range_wrapped_vs_split(a: u128, b: u128, c: u128, d: u128) {
            let outer = r(a, b);
            let inner = r(c, d);
            let by_pieces = inner.segments().iter().all(|s| s.is_sub_range_of(&outer));
            prop_assert_eq!(inner.is_sub_range_of(&outer), by_pieces);
        }

        #[test]
        fn prop_sub_range_implies_containment(a: u128, b: u128, c: u128, d: u128) {
            let outer = r(a, b);
            let inner = r(c, d);
            if inner.is_sub_range_of(&outer) {
                prop_assert!(outer.contains(inner.start));
                prop_assert!(outer.contains(inner.end));
            }
        }

        #[test]
        fn prop_sub_range_by_offsets(a: u128, len: u128, off: u128, sub: u128) {
            // Build a sub-range by walking clockwise inside the outer range.
            let off = len.checked_add(1).map_or(off, |m| off % m);
            let rest = len - off;
            let sub = rest.checked_add(1).map_or(sub, |m| sub % m);
            let outer = r(a, a.wrapping_add(len));
            let inner = r(a.wrapping_add(off), a.wrapping_add(off).wrapping_add(sub));
            prop_assert!(inner.is_sub_range_of(&outer));
        }
    }
}
