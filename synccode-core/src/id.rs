//! Identifiers for replicated content.
//!
//! ```text
//! ItemId     (clock, replica)   one character, stable across edits
//! OpId       (replica, seq)     one operation, contiguous per replica
//! Generation (epoch, author)    one reset of the document
//! ```
//!
//! `ItemId.clock` is a Lamport clock: a replica always stamps new characters
//! with a value greater than every clock it has observed, so anything inserted
//! after seeing a character sorts after it. Ties between replicas fall back to
//! the replica id, giving a total order.
//!
//! Reference: Lamport, "Time, Clocks, and the Ordering of Events" (1978)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identity of a replica. One participant owns exactly one replica per room.
pub type ReplicaId = Uuid;

/// Replica id used for characters seeded by a reset.
///
/// Seed content must carry identical ids on every replica, so it is stamped
/// with the nil UUID rather than the author of the reset.
pub const SEED_REPLICA: ReplicaId = Uuid::nil();

/// Stable logical position of a single character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub clock: u64,
    pub replica: ReplicaId,
}

impl ItemId {
    pub fn new(clock: u64, replica: ReplicaId) -> Self {
        Self { clock, replica }
    }

    /// The id `n` positions further along the same run of characters.
    pub fn offset(&self, n: u64) -> Self {
        Self {
            clock: self.clock + n,
            replica: self.replica,
        }
    }
}

impl Ord for ItemId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Identity of one operation issued by a replica.
///
/// `seq` starts at 1 for every generation and increases by exactly one per
/// operation, which is what lets receivers detect gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub seq: u64,
}

/// Tag distinguishing successive resets of the same logical document.
///
/// Ordered by epoch first, then author, so two participants resetting at the
/// same epoch still agree on which reset wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Generation {
    pub epoch: u64,
    pub author: ReplicaId,
}

impl Generation {
    /// Generation of a freshly opened, never reset document.
    pub const INITIAL: Generation = Generation {
        epoch: 0,
        author: Uuid::nil(),
    };

    /// The generation `author` issues when it resets after this one.
    pub fn next(&self, author: ReplicaId) -> Generation {
        Generation {
            epoch: self.epoch + 1,
            author,
        }
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let author = self.author.to_string();
        write!(f, "g{}@{}", self.epoch, &author[..8])
    }
}

/// Highest contiguous operation sequence applied, per replica.
///
/// Zero entries are never stored, so two vectors describing the same
/// knowledge compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    entries: BTreeMap<ReplicaId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number last applied from `replica` (0 if none).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, seq: u64) {
        if seq == 0 {
            self.entries.remove(&replica);
        } else {
            self.entries.insert(replica, seq);
        }
    }

    /// Whether the operation `id` is already reflected in this vector.
    pub fn contains(&self, id: &OpId) -> bool {
        self.get(&id.replica) >= id.seq
    }

    /// Whether every entry of `other` is covered by this vector.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .entries
            .iter()
            .all(|(replica, seq)| self.get(replica) >= *seq)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_orders_by_clock_then_replica() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        assert!(ItemId::new(1, high) < ItemId::new(2, low));
        assert!(ItemId::new(3, low) < ItemId::new(3, high));
        assert_eq!(ItemId::new(3, low).offset(2), ItemId::new(5, low));
    }

    #[test]
    fn test_generation_ordering() {
        let a = Uuid::from_u128(10);
        let b = Uuid::from_u128(20);

        let g1a = Generation::INITIAL.next(a);
        let g1b = Generation::INITIAL.next(b);
        assert!(Generation::INITIAL < g1a);
        assert!(g1a < g1b);
        assert!(g1b < g1a.next(a));
        assert_eq!(Generation::default(), Generation::INITIAL);
    }

    #[test]
    fn test_version_vector_contains_and_dominates() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);

        let mut v = VersionVector::new();
        v.set(a, 3);
        assert!(v.contains(&OpId { replica: a, seq: 3 }));
        assert!(!v.contains(&OpId { replica: a, seq: 4 }));
        assert!(!v.contains(&OpId { replica: b, seq: 1 }));

        let mut w = VersionVector::new();
        w.set(a, 2);
        assert!(v.dominates(&w));
        w.set(b, 1);
        assert!(!v.dominates(&w));
        assert_eq!(v.get(&b), 0);
    }

    #[test]
    fn test_version_vector_zero_entries_not_stored() {
        let a = Uuid::from_u128(1);
        let mut v = VersionVector::new();
        v.set(a, 0);
        assert!(v.is_empty());
        assert_eq!(v, VersionVector::new());
    }
}
