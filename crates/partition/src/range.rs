use crate::{maximum_token, minimum_token, RingPosition, Token};

/// One side of a range: the boundary value and whether it is included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RangeBound<T> {
    pub value: T,
    pub inclusive: bool,
}

impl<T> RangeBound<T> {
    pub fn inclusive(value: T) -> Self {
        Self {
            value,
            inclusive: true,
        }
    }

    pub fn exclusive(value: T) -> Self {
        Self {
            value,
            inclusive: false,
        }
    }
}

/// An interval over ring-ordered values. `None` bounds extend to the ring
/// edge. A range whose start orders after its end wraps around the ring and
/// must be split with [`Range::unwrap`] before interval arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Range<T> {
    pub start: Option<RangeBound<T>>,
    pub end: Option<RangeBound<T>>,
}

impl<T: Ord + Clone> Range<T> {
    pub fn new(start: Option<RangeBound<T>>, end: Option<RangeBound<T>>) -> Self {
        Self { start, end }
    }

    /// The full ring.
    pub fn full() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// (start, end], the usual form of a token ownership range.
    pub fn open_closed(start: T, end: T) -> Self {
        Self {
            start: Some(RangeBound::exclusive(start)),
            end: Some(RangeBound::inclusive(end)),
        }
    }

    pub fn is_wrap_around(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) => s.value > e.value,
            _ => false,
        }
    }

    pub fn contains(&self, v: &T) -> bool {
        if self.is_wrap_around() {
            return self
                .clone()
                .unwrap_wrapping()
                .iter()
                .any(|half| half.contains(v));
        }
        let after_start = match &self.start {
            None => true,
            Some(b) => match v.cmp(&b.value) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => b.inclusive,
                std::cmp::Ordering::Less => false,
            },
        };
        let before_end = match &self.end {
            None => true,
            Some(b) => match v.cmp(&b.value) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => b.inclusive,
                std::cmp::Ordering::Greater => false,
            },
        };
        after_start && before_end
    }

    /// Split a wrap-around range into its (start → edge) and (edge → end)
    /// halves. Non-wrapping ranges pass through unchanged.
    pub fn unwrap_wrapping(self) -> Vec<Self> {
        if !self.is_wrap_around() {
            return vec![self];
        }
        vec![
            Self {
                start: self.start,
                end: None,
            },
            Self {
                start: None,
                end: self.end,
            },
        ]
    }

    /// Intersection of two non-wrapping ranges, or `None` when disjoint.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        debug_assert!(!self.is_wrap_around() && !other.is_wrap_around());

        let start = match (&self.start, &other.start) {
            (None, s) | (s, None) => s.clone(),
            (Some(a), Some(b)) => Some(match a.value.cmp(&b.value) {
                std::cmp::Ordering::Less => b.clone(),
                std::cmp::Ordering::Greater => a.clone(),
                std::cmp::Ordering::Equal => RangeBound {
                    value: a.value.clone(),
                    inclusive: a.inclusive && b.inclusive,
                },
            }),
        };
        let end = match (&self.end, &other.end) {
            (None, e) | (e, None) => e.clone(),
            (Some(a), Some(b)) => Some(match a.value.cmp(&b.value) {
                std::cmp::Ordering::Less => a.clone(),
                std::cmp::Ordering::Greater => b.clone(),
                std::cmp::Ordering::Equal => RangeBound {
                    value: a.value.clone(),
                    inclusive: a.inclusive && b.inclusive,
                },
            }),
        };

        let out = Self { start, end };
        match (&out.start, &out.end) {
            (Some(s), Some(e)) => {
                let non_empty = s.value < e.value
                    || (s.value == e.value && s.inclusive && e.inclusive);
                non_empty.then_some(out)
            }
            _ => Some(out),
        }
    }

    /// Portions of `self` not covered by `other`; both non-wrapping.
    /// Yields zero, one, or two ranges.
    pub fn subtract(&self, other: &Self) -> Vec<Self> {
        debug_assert!(!self.is_wrap_around() && !other.is_wrap_around());

        let Some(overlap) = self.intersection(other) else {
            return vec![self.clone()];
        };
        let mut out = Vec::new();

        // Left remainder: self.start up to the overlap's start.
        if let Some(os) = &overlap.start {
            let left = Self {
                start: self.start.clone(),
                end: Some(RangeBound {
                    value: os.value.clone(),
                    inclusive: !os.inclusive,
                }),
            };
            if !left.is_empty_left_of(os) {
                out.push(left);
            }
        }
        // Right remainder: the overlap's end up to self.end.
        if let Some(oe) = &overlap.end {
            let right = Self {
                start: Some(RangeBound {
                    value: oe.value.clone(),
                    inclusive: !oe.inclusive,
                }),
                end: self.end.clone(),
            };
            if !right.is_empty_right_of(oe) {
                out.push(right);
            }
        }
        out
    }

    // True when the left remainder collapsed to nothing: self starts at or
    // after the overlap's start.
    fn is_empty_left_of(&self, overlap_start: &RangeBound<T>) -> bool {
        match &self.start {
            None => false,
            Some(s) => {
                s.value > overlap_start.value
                    || (s.value == overlap_start.value && !(s.inclusive && !overlap_start.inclusive))
            }
        }
    }

    fn is_empty_right_of(&self, overlap_end: &RangeBound<T>) -> bool {
        match &self.end {
            None => false,
            Some(e) => {
                e.value < overlap_end.value
                    || (e.value == overlap_end.value && !(e.inclusive && !overlap_end.inclusive))
            }
        }
    }
}

/// A token range as a range of ring positions: inclusive token bounds map
/// to the far side of the token's keys so every key with that token is
/// covered.
pub fn to_partition_range(r: Range<Token>) -> Range<RingPosition> {
    let start = r.start.map(|b| RangeBound {
        value: if b.inclusive {
            RingPosition::starting_at(b.value)
        } else {
            RingPosition::ending_at(b.value)
        },
        inclusive: b.inclusive,
    });
    let end = r.end.map(|b| RangeBound {
        value: if b.inclusive {
            RingPosition::ending_at(b.value)
        } else {
            RingPosition::starting_at(b.value)
        },
        inclusive: b.inclusive,
    });
    Range { start, end }
}

/// Ownership ranges of a sorted ring: `(prev, token]` per token, with the
/// first token also owning the wrap segment from the last token.
pub fn ring_ranges(sorted_tokens: &[Token]) -> Vec<Range<Token>> {
    match sorted_tokens {
        [] => vec![Range::full()],
        [only] => vec![
            Range::new(None, Some(RangeBound::inclusive(only.clone()))),
            Range::new(Some(RangeBound::exclusive(only.clone())), None),
        ],
        _ => {
            let mut out = Vec::with_capacity(sorted_tokens.len() + 1);
            let first = sorted_tokens.first().unwrap();
            let last = sorted_tokens.last().unwrap();
            out.push(Range::new(None, Some(RangeBound::inclusive(first.clone()))));
            for pair in sorted_tokens.windows(2) {
                out.push(Range::open_closed(pair[0].clone(), pair[1].clone()));
            }
            out.push(Range::new(Some(RangeBound::exclusive(last.clone())), None));
            out
        }
    }
}

// Keep the sentinels reachable for range callers without importing token
// internals everywhere.
pub fn full_token_range() -> Range<Token> {
    Range::new(
        Some(RangeBound::exclusive(minimum_token())),
        Some(RangeBound::inclusive(maximum_token())),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    fn t(v: u64) -> Token {
        Token::from_u64(v)
    }

    #[test]
    fn contains_respects_bound_inclusivity() {
        let r = Range::open_closed(t(10), t(20));
        assert!(!r.contains(&t(10)));
        assert!(r.contains(&t(11)));
        assert!(r.contains(&t(20)));
        assert!(!r.contains(&t(21)));
    }

    #[test]
    fn wrap_around_splits_at_the_edge() {
        let r = Range::open_closed(t(100), t(10));
        assert!(r.is_wrap_around());
        assert!(r.contains(&t(5)));
        assert!(r.contains(&t(200)));
        assert!(!r.contains(&t(50)));

        let halves = r.unwrap_wrapping();
        assert_eq!(
            halves,
            vec![
                Range::new(Some(RangeBound::exclusive(t(100))), None),
                Range::new(None, Some(RangeBound::inclusive(t(10)))),
            ]
        );
    }

    #[test]
    fn intersection_of_overlapping_ranges() {
        let a = Range::open_closed(t(10), t(30));
        let b = Range::open_closed(t(20), t(40));
        assert_eq!(a.intersection(&b), Some(Range::open_closed(t(20), t(30))));
    }

    #[test]
    fn intersection_of_disjoint_ranges_is_none() {
        let a = Range::open_closed(t(10), t(20));
        let b = Range::open_closed(t(30), t(40));
        assert_eq!(a.intersection(&b), None);
    }

    #[test]
    fn touching_exclusive_bounds_do_not_intersect() {
        let a = Range::open_closed(t(10), t(20));
        let b = Range::open_closed(t(20), t(30));
        // a ends inclusive at 20, b starts exclusive at 20.
        assert_eq!(a.intersection(&b), None);
    }

    #[test]
    fn subtract_middle_leaves_two_pieces() {
        let a = Range::open_closed(t(0), t(100));
        let b = Range::open_closed(t(20), t(50));
        let out = a.subtract(&b);
        assert_eq!(
            out,
            vec![Range::open_closed(t(0), t(20)), Range::open_closed(t(50), t(100)),]
        );
    }

    #[test]
    fn subtract_covering_range_leaves_nothing() {
        let a = Range::open_closed(t(20), t(50));
        let b = Range::open_closed(t(0), t(100));
        assert!(a.subtract(&b).is_empty());
    }

    #[test]
    fn subtract_disjoint_returns_self() {
        let a = Range::open_closed(t(0), t(10));
        let b = Range::open_closed(t(50), t(60));
        assert_eq!(a.subtract(&b), vec![a]);
    }

    #[test]
    fn ring_ranges_cover_the_ring() {
        let tokens = vec![t(10), t(20), t(30)];
        let ranges = ring_ranges(&tokens);
        assert_eq!(ranges.len(), 4);
        for v in [0u64, 10, 15, 20, 25, 30, 1000] {
            assert_eq!(
                ranges.iter().filter(|r| r.contains(&t(v))).count(),
                1,
                "token {v} covered exactly once"
            );
        }
    }
}
