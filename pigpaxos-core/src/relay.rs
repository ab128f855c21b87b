//! Relay groups: partition peers into groups and pick a relay per group
//! per round (§3, §4.4).

use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashMap;

use crate::gray::GrayList;
use crate::id::Id;

/// An ordered set of ids; the unit of aggregation for one relay group.
#[derive(Clone, Debug, Default)]
pub struct PeerGroup {
    pub nodes: Vec<Id>,
}

impl PeerGroup {
    /// Samples a member uniformly, excluding `exclude` and any gray
    /// member. Falls through (keeps retrying) only while some non-gray,
    /// non-excluded candidate exists; returns `None` if the whole group is
    /// unusable (§4.4 "fall through if all are gray").
    pub fn random_node(&self, exclude: Id, gray: &GrayList) -> Option<Id> {
        let candidates: Vec<Id> = self
            .nodes
            .iter()
            .copied()
            .filter(|&id| id != exclude && !gray.is_gray(id))
            .collect();
        candidates.choose(&mut thread_rng()).copied()
    }
}

/// How relays are chosen for a broadcast round.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RelayPolicy {
    /// Sample once at construction and reuse for every round (`--wfr`).
    Fixed,
    /// Sample fresh, excluding gray members, every round.
    Random,
}

/// How the cluster is partitioned into relay groups (§4.4).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionMode {
    /// Pack `N` sorted ids contiguously into `K` groups, `floor(N/K)` per
    /// group (`--npg`).
    Numeric(usize),
    /// One group per zone; home group is `self.zone - 1` (`--wrpg`).
    Region,
}

/// The relay-group topology for one replica: every other node's group,
/// this node's home group, and (if `--wfr`) the fixed relay per group.
pub struct RelayGroups {
    pub groups: Vec<PeerGroup>,
    pub node_to_group: HashMap<Id, usize>,
    pub my_group: usize,
    pub policy: RelayPolicy,
    fixed_relays: Vec<Option<Id>>,
}

impl RelayGroups {
    /// Builds relay groups for `self_id` given the cluster's sorted
    /// membership and a partition mode (§4.4).
    pub fn build(self_id: Id, known_ids: &[Id], mode: PartitionMode, policy: RelayPolicy) -> Self {
        let (groups, my_group) = match mode {
            PartitionMode::Numeric(num_groups) => numeric_partition(self_id, known_ids, num_groups),
            PartitionMode::Region => region_partition(self_id, known_ids),
        };

        let mut node_to_group = HashMap::new();
        for (i, pg) in groups.iter().enumerate() {
            for &id in &pg.nodes {
                node_to_group.insert(id, i);
            }
        }

        let fixed_relays = vec![None; groups.len()];
        let mut rg = RelayGroups {
            groups,
            node_to_group,
            my_group,
            policy,
            fixed_relays,
        };
        if policy == RelayPolicy::Fixed {
            rg.sample_fixed_relays(self_id);
        }
        rg
    }

    fn sample_fixed_relays(&mut self, self_id: Id) {
        let empty_gray = GrayList::new(std::time::Duration::from_secs(0));
        for i in 0..self.groups.len() {
            self.fixed_relays[i] = self.groups[i].random_node(self_id, &empty_gray);
        }
    }

    /// Picks the relay to use for group `i` this round.
    pub fn pick_relay(&self, i: usize, self_id: Id, gray: &GrayList) -> Option<Id> {
        match self.policy {
            RelayPolicy::Fixed => self.fixed_relays[i],
            RelayPolicy::Random => self.groups[i].random_node(self_id, gray),
        }
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group_of(&self, id: Id) -> Option<usize> {
        self.node_to_group.get(&id).copied()
    }

    pub fn home_group(&self) -> &PeerGroup {
        &self.groups[self.my_group]
    }
}

fn numeric_partition(self_id: Id, known_ids: &[Id], num_groups: usize) -> (Vec<PeerGroup>, usize) {
    let mut groups = vec![PeerGroup::default(); num_groups];
    let nodes_per_group = (known_ids.len() / num_groups).max(1);
    let mut group_idx = 0;
    let mut added_to_group = 0;
    let mut my_group = 0;

    for &id in known_ids {
        if id == self_id {
            my_group = group_idx;
        }
        groups[group_idx].nodes.push(id);
        added_to_group += 1;
        if added_to_group >= nodes_per_group && group_idx + 1 < num_groups {
            group_idx += 1;
            added_to_group = 0;
        }
    }
    (groups, my_group)
}

fn region_partition(self_id: Id, known_ids: &[Id]) -> (Vec<PeerGroup>, usize) {
    let num_groups = known_ids.iter().map(|id| id.zone()).max().unwrap_or(0) as usize;
    let mut groups = vec![PeerGroup::default(); num_groups.max(1)];
    for &id in known_ids {
        let group = (id.zone() as usize).saturating_sub(1);
        groups[group].nodes.push(id);
    }
    let my_group = (self_id.zone() as usize).saturating_sub(1);
    (groups, my_group)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(pairs: &[(u16, u16)]) -> Vec<Id> {
        pairs.iter().map(|&(z, n)| Id::new(z, n)).collect()
    }

    #[test]
    fn numeric_partition_packs_contiguously() {
        let known = ids(&[(1, 1), (1, 2), (1, 3), (1, 4), (1, 5), (1, 6)]);
        let rg = RelayGroups::build(
            Id::new(1, 1),
            &known,
            PartitionMode::Numeric(2),
            RelayPolicy::Random,
        );
        assert_eq!(rg.num_groups(), 2);
        assert_eq!(rg.groups[0].nodes.len(), 3);
        assert_eq!(rg.groups[1].nodes.len(), 3);
        assert_eq!(rg.my_group, 0);
    }

    #[test]
    fn region_partition_uses_zone_minus_one() {
        let known = ids(&[(1, 1), (1, 2), (2, 1), (2, 2)]);
        let rg = RelayGroups::build(Id::new(2, 1), &known, PartitionMode::Region, RelayPolicy::Random);
        assert_eq!(rg.num_groups(), 2);
        assert_eq!(rg.my_group, 1);
        assert_eq!(rg.group_of(Id::new(1, 2)), Some(0));
    }

    #[test]
    fn random_relay_excludes_self_and_gray() {
        let known = ids(&[(1, 1), (1, 2), (1, 3)]);
        let pg = PeerGroup { nodes: known };
        let mut gray = GrayList::new(std::time::Duration::from_secs(10));
        gray.mark(Id::new(1, 2), std::time::Instant::now());
        for _ in 0..20 {
            let picked = pg.random_node(Id::new(1, 1), &gray).unwrap();
            assert_ne!(picked, Id::new(1, 1));
            assert_ne!(picked, Id::new(1, 2));
        }
    }

    #[test]
    fn random_relay_none_when_group_fully_gray() {
        let known = ids(&[(1, 1), (1, 2)]);
        let pg = PeerGroup { nodes: known };
        let mut gray = GrayList::new(std::time::Duration::from_secs(10));
        gray.mark(Id::new(1, 2), std::time::Instant::now());
        assert!(pg.random_node(Id::new(1, 1), &gray).is_none());
    }
}
