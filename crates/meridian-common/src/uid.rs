//! # UID ranges
//!
//! Policy overlays and VPNs scope their routing rules by inclusive UID
//! ranges. Rules already installed in the configuration backend are updated
//! by exact difference (add what is new, remove what is gone), so the set
//! type here keeps its ranges normalized: sorted, disjoint and never
//! adjacent. Two sets covering the same UIDs therefore compare equal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ArbiterError;

/// Number of UIDs reserved for each user.
pub const PER_USER_RANGE: u32 = 100_000;
pub const SYSTEM_UID: u32 = 1000;
pub const FIRST_APPLICATION_UID: u32 = 10_000;

pub type UserId = u32;

/// Inclusive range of UIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UidRange {
    pub start: u32,
    pub stop: u32,
}

impl UidRange {
    pub fn new(start: u32, stop: u32) -> Result<Self, ArbiterError> {
        if start > stop {
            return Err(ArbiterError::InvalidArgument(format!(
                "uid range start {start} is after stop {stop}"
            )));
        }
        Ok(Self { start, stop })
    }

    pub fn single(uid: u32) -> Self {
        Self {
            start: uid,
            stop: uid,
        }
    }

    /// Every UID belonging to `user`.
    pub fn for_user(user: UserId) -> Self {
        let start = user.saturating_mul(PER_USER_RANGE);
        Self {
            start,
            stop: start.saturating_add(PER_USER_RANGE - 1),
        }
    }

    pub fn start_user(&self) -> UserId {
        self.start / PER_USER_RANGE
    }

    pub fn stop_user(&self) -> UserId {
        self.stop / PER_USER_RANGE
    }

    pub fn contains_uid(&self, uid: u32) -> bool {
        self.start <= uid && uid <= self.stop
    }

    pub fn contains_range(&self, other: &UidRange) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }

    pub fn overlaps(&self, other: &UidRange) -> bool {
        self.start <= other.stop && other.start <= self.stop
    }

    pub fn count(&self) -> u64 {
        u64::from(self.stop - self.start) + 1
    }

    /// The UIDs of `self` not covered by `remove`.
    pub fn subtract(&self, remove: &UidRangeSet) -> UidRangeSet {
        UidRangeSet::from(*self).difference(remove)
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.stop {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.stop)
        }
    }
}

/// Normalized set of UID ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UidRangeSet {
    ranges: Vec<UidRange>,
}

impl UidRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = UidRange>) -> Self {
        let mut ranges: Vec<UidRange> = ranges.into_iter().collect();
        ranges.sort();
        let mut out: Vec<UidRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match out.last_mut() {
                Some(last) if r.start <= last.stop.saturating_add(1) => {
                    last.stop = last.stop.max(r.stop);
                }
                _ => out.push(r),
            }
        }
        Self { ranges: out }
    }

    /// Collapses individual UIDs into ranges; consecutive UIDs share one range.
    pub fn from_uids(uids: impl IntoIterator<Item = u32>) -> Self {
        Self::from_ranges(uids.into_iter().map(UidRange::single))
    }

    /// Full ranges for each of `users`.
    pub fn for_users(users: impl IntoIterator<Item = UserId>) -> Self {
        Self::from_ranges(users.into_iter().map(UidRange::for_user))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UidRange> {
        self.ranges.iter()
    }

    pub fn ranges(&self) -> &[UidRange] {
        &self.ranges
    }

    pub fn uid_count(&self) -> u64 {
        self.ranges.iter().map(UidRange::count).sum()
    }

    pub fn insert(&mut self, range: UidRange) {
        let mut all = std::mem::take(&mut self.ranges);
        all.push(range);
        *self = Self::from_ranges(all);
    }

    pub fn union(&self, other: &UidRangeSet) -> UidRangeSet {
        Self::from_ranges(self.ranges.iter().chain(other.ranges.iter()).copied())
    }

    pub fn difference(&self, other: &UidRangeSet) -> UidRangeSet {
        let mut out = Vec::new();
        for r in &self.ranges {
            let mut start = r.start;
            let mut exhausted = false;
            for cut in other.ranges.iter().filter(|c| c.overlaps(r)) {
                if cut.start > start {
                    out.push(UidRange {
                        start,
                        stop: cut.start - 1,
                    });
                }
                if cut.stop >= r.stop {
                    exhausted = true;
                    break;
                }
                start = start.max(cut.stop + 1);
            }
            if !exhausted {
                out.push(UidRange { start, stop: r.stop });
            }
        }
        // Pieces come out sorted and disjoint already.
        Self { ranges: out }
    }

    pub fn intersection(&self, other: &UidRangeSet) -> UidRangeSet {
        self.difference(&self.difference(other))
    }

    pub fn contains_uid(&self, uid: u32) -> bool {
        self.ranges.iter().any(|r| r.contains_uid(uid))
    }

    /// Whether every UID of `other` is in `self`.
    pub fn covers(&self, other: &UidRangeSet) -> bool {
        other
            .ranges
            .iter()
            .all(|o| self.ranges.iter().any(|r| r.contains_range(o)))
    }

    pub fn overlaps(&self, other: &UidRangeSet) -> bool {
        self.ranges
            .iter()
            .any(|r| other.ranges.iter().any(|o| r.overlaps(o)))
    }
}

impl From<UidRange> for UidRangeSet {
    fn from(range: UidRange) -> Self {
        Self {
            ranges: vec![range],
        }
    }
}

impl FromIterator<UidRange> for UidRangeSet {
    fn from_iter<T: IntoIterator<Item = UidRange>>(iter: T) -> Self {
        Self::from_ranges(iter)
    }
}

impl fmt::Display for UidRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn r(start: u32, stop: u32) -> UidRange {
        UidRange::new(start, stop).unwrap()
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(matches!(
            UidRange::new(10, 9),
            Err(ArbiterError::InvalidArgument(_))
        ));
    }

    #[test]
    fn user_ranges() {
        let user10 = UidRange::for_user(10);
        assert_eq!(user10, r(1_000_000, 1_099_999));
        assert_eq!(user10.start_user(), 10);
        assert_eq!(user10.stop_user(), 10);
        assert_eq!(user10.count(), 100_000);
    }

    #[test]
    fn normalization_merges_adjacent_and_overlapping() {
        let set = UidRangeSet::from_ranges([r(10, 20), r(21, 30), r(25, 40), r(50, 50)]);
        assert_eq!(set.ranges(), &[r(10, 40), r(50, 50)]);
        assert_eq!(UidRangeSet::from_uids([3, 1, 2, 7]).ranges(), &[r(1, 3), r(7, 7)]);
    }

    #[test]
    fn subtract_single_uid_splits_range() {
        let user = UidRange::for_user(0);
        let out = user.subtract(&UidRangeSet::from(UidRange::single(10_123)));
        assert_eq!(out.ranges(), &[r(0, 10_122), r(10_124, 99_999)]);
        assert_eq!(out.uid_count(), 99_999);
    }

    #[test]
    fn subtract_at_edges() {
        let base = UidRangeSet::from(r(100, 200));
        assert_eq!(
            base.difference(&UidRangeSet::from(r(100, 100))).ranges(),
            &[r(101, 200)]
        );
        assert_eq!(
            base.difference(&UidRangeSet::from(r(200, 300))).ranges(),
            &[r(100, 199)]
        );
        assert!(base.difference(&UidRangeSet::from(r(0, 1000))).is_empty());
        assert_eq!(
            base.difference(&UidRangeSet::from_ranges([r(110, 120), r(150, 160)]))
                .ranges(),
            &[r(100, 109), r(121, 149), r(161, 200)]
        );
    }

    #[test]
    fn covers_and_overlaps() {
        let set = UidRangeSet::from_ranges([r(0, 99), r(200, 299)]);
        assert!(set.covers(&UidRangeSet::from(r(10, 20))));
        assert!(!set.covers(&UidRangeSet::from(r(90, 210))));
        assert!(set.overlaps(&UidRangeSet::from(r(90, 110))));
        assert!(!set.overlaps(&UidRangeSet::from(r(100, 199))));
        assert!(set.covers(&UidRangeSet::new()));
    }

    #[test]
    fn max_uid_does_not_overflow() {
        let set = UidRangeSet::from_ranges([r(u32::MAX - 1, u32::MAX), r(u32::MAX, u32::MAX)]);
        assert_eq!(set.ranges(), &[r(u32::MAX - 1, u32::MAX)]);
        assert!(set.difference(&set).is_empty());
    }

    fn small_set() -> impl Strategy<Value = UidRangeSet> {
        prop::collection::vec((0u32..200, 0u32..20), 0..6).prop_map(|v| {
            UidRangeSet::from_ranges(v.into_iter().map(|(s, len)| UidRange {
                start: s,
                stop: s + len,
            }))
        })
    }

    proptest! {
        #[test]
        fn proptest_difference_membership(a in small_set(), b in small_set()) {
            let diff = a.difference(&b);
            for uid in 0..230 {
                prop_assert_eq!(
                    diff.contains_uid(uid),
                    a.contains_uid(uid) && !b.contains_uid(uid)
                );
            }
        }

        #[test]
        fn proptest_union_and_intersection(a in small_set(), b in small_set()) {
            let union = a.union(&b);
            let inter = a.intersection(&b);
            for uid in 0..230 {
                prop_assert_eq!(union.contains_uid(uid), a.contains_uid(uid) || b.contains_uid(uid));
                prop_assert_eq!(inter.contains_uid(uid), a.contains_uid(uid) && b.contains_uid(uid));
            }
            prop_assert_eq!(inter.is_empty(), !a.overlaps(&b));
            prop_assert!(union.covers(&a) && union.covers(&b));
        }

        #[test]
        fn proptest_difference_is_normalized(a in small_set(), b in small_set()) {
            let diff = a.difference(&b);
            prop_assert_eq!(UidRangeSet::from_ranges(diff.iter().copied()), diff);
        }
    }
}
