//! Node identifiers in `zone.node` form (§3, §4.1).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A cluster member identifier, packed as `zone:16 | node:16`.
///
/// Ordering is lexicographic on `(zone, node)`, matching the original
/// `compareID` used to sort relay-group membership.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
pub struct Id(u32);

impl Id {
    /// Builds an id from its zone and node components.
    pub fn new(zone: u16, node: u16) -> Self {
        Id(((zone as u32) << 16) | node as u32)
    }

    /// The zone component.
    pub fn zone(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The node component.
    pub fn node(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// `true` for the zero value, used as "no owner" in `Ballot::BOTTOM`.
    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.zone(), self.node())
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.zone(), self.node()).cmp(&(other.zone(), other.node()))
    }
}

/// Error returned when parsing an [`Id`] from its `"Z.N"` string form fails.
#[derive(Debug, thiserror::Error)]
#[error("invalid id string: {0:?}")]
pub struct ParseIdError(String);

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let (zone, node) = match (parts.next(), parts.next(), parts.next()) {
            (Some(z), Some(n), None) => (z, n),
            _ => return Err(ParseIdError(s.to_string())),
        };
        let zone: u16 = zone.parse().map_err(|_| ParseIdError(s.to_string()))?;
        let node: u16 = node.parse().map_err(|_| ParseIdError(s.to_string()))?;
        Ok(Id::new(zone, node))
    }
}

/// Sorts a list of ids by `(zone, node)`, matching `IDs.Sort()` in the
/// original source; used to derive stable relay-group membership.
pub fn sort_ids(ids: &mut [Id]) {
    ids.sort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_string_form() {
        let id = Id::new(1, 7);
        assert_eq!(id.to_string(), "1.7");
        assert_eq!("1.7".parse::<Id>().unwrap(), id);
    }

    #[test]
    fn orders_by_zone_then_node() {
        assert!(Id::new(1, 9) < Id::new(2, 0));
        assert!(Id::new(1, 1) < Id::new(1, 2));
        assert_eq!(Id::new(1, 1), Id::new(1, 1));
    }

    #[test]
    fn nil_id_is_zero() {
        assert!(Id::default().is_nil());
        assert!(!Id::new(1, 1).is_nil());
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!("not-an-id".parse::<Id>().is_err());
        assert!("1".parse::<Id>().is_err());
        assert!("1.2.3".parse::<Id>().is_err());
    }
}
