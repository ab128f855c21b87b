//! Ballot arithmetic (§3, §4.1).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::Id;

/// A totally ordered `(counter, owner)` pair. Greater counter wins; ties
/// are broken by owner id order. [`Ballot::BOTTOM`] means "none".
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
pub struct Ballot {
    counter: u64,
    owner: Id,
}

impl Ballot {
    /// The "no ballot seen yet" sentinel.
    pub const BOTTOM: Ballot = Ballot {
        counter: 0,
        owner: Id::new(0, 0),
    };

    /// Builds a ballot directly from its parts, mostly useful in tests.
    pub fn new(counter: u64, owner: Id) -> Self {
        Ballot { counter, owner }
    }

    /// The owning node, i.e. `ballot.ID()` in the original source.
    pub fn id(&self) -> Id {
        self.owner
    }

    /// The raw counter.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// `true` for [`Ballot::BOTTOM`].
    pub fn is_bottom(&self) -> bool {
        *self == Ballot::BOTTOM
    }

    /// Increments the counter and stamps `self_id` as owner: `Next(b)`.
    pub fn next(&self, self_id: Id) -> Ballot {
        Ballot {
            counter: self.counter + 1,
            owner: self_id,
        }
    }
}

impl fmt::Debug for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.counter, self.owner)
    }
}

impl PartialOrd for Ballot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ballot {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.counter, self.owner).cmp(&(other.counter, other.owner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_counter_wins() {
        let low = Ballot::new(1, Id::new(9, 9));
        let high = Ballot::new(2, Id::new(1, 1));
        assert!(high > low);
    }

    #[test]
    fn ties_break_on_owner() {
        let a = Ballot::new(5, Id::new(1, 1));
        let b = Ballot::new(5, Id::new(1, 2));
        assert!(b > a);
    }

    #[test]
    fn next_stamps_self_and_increments() {
        let b = Ballot::new(3, Id::new(2, 2));
        let n = b.next(Id::new(9, 9));
        assert_eq!(n.counter(), 4);
        assert_eq!(n.id(), Id::new(9, 9));
    }

    #[test]
    fn bottom_is_less_than_any_real_ballot() {
        assert!(Ballot::BOTTOM < Ballot::new(1, Id::new(1, 1)));
        assert!(Ballot::BOTTOM.is_bottom());
    }
}
