//! Replicated text buffer (RGA-style sequence CRDT).
//!
//! ## Architecture
//!
//! ```text
//! local edit                          remote Operation
//!     │                                     │
//!     ▼                                     ▼
//! Document::insert / delete          Document::apply
//!     │                                     │
//!     │                     ┌───────────────┼──────────────┐
//!     │                     ▼               ▼              ▼
//!     │                older generation  not ready     ready / duplicate
//!     │                  (discard)      (buffer)           │
//!     ▼                                                    ▼
//! integrate() ◄──────────────────────────────────────── integrate()
//!     │                                                    │
//!     ▼                                                    ▼
//! elements: [seed…][a][b̶][c]…   (tombstones kept until every replica acks)
//! ```
//!
//! Every character carries an [`ItemId`] and remembers nothing but whether it
//! was deleted. An insert names the character it goes after (its origin);
//! integration walks right from the origin, skipping every element with a
//! greater id, which places concurrent inserts at the same boundary in
//! descending id order on every replica.
//!
//! Reference: Roh et al., "Replicated abstract data types" (2011)
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use log::debug;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::Range;

use crate::id::{Generation, ItemId, OpId, ReplicaId, VersionVector, SEED_REPLICA};

/// Errors raised by the replicated document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// An internal invariant was violated; the buffer is left untouched.
    #[error("merge invariant violated: {0}")]
    MergeConflictImpossible(String),
    #[error("position {position} out of bounds (len {len})")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error("range {start}..{end} out of bounds (len {len})")]
    RangeOutOfBounds { start: usize, end: usize, len: usize },
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert `text` after `origin` (`None` = document start). Character `i`
    /// of `text` gets id `first.offset(i)`.
    Insert {
        origin: Option<ItemId>,
        first: ItemId,
        text: String,
    },
    /// Tombstone the given characters.
    Delete { targets: Vec<ItemId> },
    /// Clear the document and seed it with `text` as a new generation.
    Reset { text: String },
}

/// One immutable, replica-owned edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub generation: Generation,
    pub id: OpId,
    /// Operations the issuer had applied when it produced this one.
    pub deps: VersionVector,
    pub kind: OpKind,
}

impl Operation {
    pub fn is_reset(&self) -> bool {
        matches!(self.kind, OpKind::Reset { .. })
    }
}

/// Result of merging a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation (and `integrated - 1` previously buffered ones) took effect.
    Applied { integrated: usize },
    /// Already seen; nothing changed.
    Duplicate,
    /// Causal dependencies are missing; held until they arrive.
    Buffered,
    /// Tagged with a generation older than the current one; discarded.
    Stale,
}

/// A single character slot, visible or tombstoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ItemId,
    pub ch: char,
    pub deleted: bool,
}

/// Full replica state, used to bring a late joiner up to date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub generation: Generation,
    pub clock: u64,
    pub version: VersionVector,
    pub elements: Vec<Element>,
}

/// One replica of the shared buffer.
#[derive(Debug, Clone)]
pub struct Document {
    replica: ReplicaId,
    generation: Generation,
    /// Lamport clock: the highest `ItemId::clock` observed or issued.
    clock: u64,
    version: VersionVector,
    elements: Vec<Element>,
    /// Operations waiting on causal dependencies or on a future reset.
    pending: Vec<Operation>,
    /// Latest version each remote replica reported having applied.
    acks: Vec<(ReplicaId, VersionVector)>,
}

impl Document {
    /// Create an empty replica in the initial generation.
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            generation: Generation::INITIAL,
            clock: 0,
            version: VersionVector::new(),
            elements: Vec::new(),
            pending: Vec::new(),
            acks: Vec::new(),
        }
    }

    /// Create a replica already seeded with `text` in the initial generation.
    ///
    /// Replicas seeded with the same text agree on every id.
    pub fn with_text(replica: ReplicaId, text: &str) -> Self {
        let mut doc = Self::new(replica);
        doc.install(Generation::INITIAL, text);
        doc
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.elements.iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tombstones still held.
    pub fn tombstones(&self) -> usize {
        self.elements.iter().filter(|e| e.deleted).count()
    }

    /// Number of operations waiting in the causal buffer.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Materialize the visible text.
    pub fn snapshot(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.ch)
            .collect()
    }

    // ─── Local edits ─────────────────────────────────────────────

    /// Insert `text` before the character currently at `position`.
    ///
    /// The edit is applied locally before the operation is returned.
    pub fn insert(&mut self, position: usize, text: &str) -> Result<Operation, DocumentError> {
        let len = self.len();
        if position > len {
            return Err(DocumentError::PositionOutOfBounds { position, len });
        }

        let origin = match position {
            0 => None,
            n => self.visible_id(n - 1),
        };
        let op = Operation {
            generation: self.generation,
            id: self.next_op_id(),
            deps: self.version.clone(),
            kind: OpKind::Insert {
                origin,
                first: ItemId::new(self.clock + 1, self.replica),
                text: text.to_string(),
            },
        };
        self.integrate(&op)?;
        Ok(op)
    }

    /// Delete the visible characters in `range`.
    pub fn delete(&mut self, range: Range<usize>) -> Result<Operation, DocumentError> {
        let len = self.len();
        if range.start > range.end || range.end > len {
            return Err(DocumentError::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                len,
            });
        }

        let targets: Vec<ItemId> = self
            .elements
            .iter()
            .filter(|e| !e.deleted)
            .skip(range.start)
            .take(range.end - range.start)
            .map(|e| e.id)
            .collect();
        let op = Operation {
            generation: self.generation,
            id: self.next_op_id(),
            deps: self.version.clone(),
            kind: OpKind::Delete { targets },
        };
        self.integrate(&op)?;
        Ok(op)
    }

    /// Discard all content and seed `text` under a fresh generation.
    ///
    /// Operations still in flight from the previous generation become stale
    /// everywhere once this reset is applied.
    pub fn reset(&mut self, text: &str) -> Operation {
        let generation = self.generation.next(self.replica);
        self.install(generation, text);
        Operation {
            generation,
            id: OpId {
                replica: self.replica,
                seq: 0,
            },
            deps: VersionVector::new(),
            kind: OpKind::Reset {
                text: text.to_string(),
            },
        }
    }

    // ─── Remote merge ────────────────────────────────────────────

    /// Merge an operation produced by any replica (including echoes of our own).
    pub fn apply(&mut self, op: Operation) -> Result<ApplyOutcome, DocumentError> {
        match op.generation.cmp(&self.generation) {
            Ordering::Less => {
                debug!(
                    "discarding stale op {:?} from {} (current {})",
                    op.id, op.generation, self.generation
                );
                return Ok(ApplyOutcome::Stale);
            }
            Ordering::Greater => {
                if let OpKind::Reset { text } = &op.kind {
                    self.install(op.generation, text);
                    let drained = self.drain_pending()?;
                    return Ok(ApplyOutcome::Applied {
                        integrated: 1 + drained,
                    });
                }
                debug!("buffering op {:?} for future generation {}", op.id, op.generation);
                self.buffer(op);
                return Ok(ApplyOutcome::Buffered);
            }
            Ordering::Equal => {}
        }

        if op.is_reset() || self.version.contains(&op.id) {
            return Ok(ApplyOutcome::Duplicate);
        }
        if !self.is_ready(&op) {
            debug!("buffering op {:?}: causal dependencies missing", op.id);
            self.buffer(op);
            return Ok(ApplyOutcome::Buffered);
        }

        self.integrate(&op)?;
        let drained = self.drain_pending()?;
        Ok(ApplyOutcome::Applied {
            integrated: 1 + drained,
        })
    }

    // ─── State transfer ──────────────────────────────────────────

    pub fn state(&self) -> DocumentState {
        DocumentState {
            generation: self.generation,
            clock: self.clock,
            version: self.version.clone(),
            elements: self.elements.clone(),
        }
    }

    /// Adopt a full state from another replica.
    ///
    /// Only accepted when it is from a newer generation, or from the same
    /// generation and strictly ahead of this replica. Returns whether the
    /// state was adopted.
    pub fn load_state(&mut self, state: DocumentState) -> Result<bool, DocumentError> {
        let adopt = match state.generation.cmp(&self.generation) {
            Ordering::Greater => true,
            Ordering::Equal => {
                state.version.dominates(&self.version) && state.version != self.version
            }
            Ordering::Less => false,
        };
        if !adopt {
            return Ok(false);
        }
        self.adopt_state(state)?;
        Ok(true)
    }

    /// Replace this replica's content with `state` unconditionally.
    ///
    /// Used by a replica that has not issued anything since (re)joining, so
    /// there is nothing of its own to lose. Buffered operations from the
    /// adopted generation onwards are kept and drained.
    pub fn adopt_state(&mut self, state: DocumentState) -> Result<(), DocumentError> {
        self.generation = state.generation;
        self.clock = self.clock.max(state.clock);
        self.version = state.version;
        self.elements = state.elements;
        self.acks.clear();
        let generation = self.generation;
        self.pending.retain(|op| op.generation >= generation);
        self.drain_pending()?;
        Ok(())
    }

    // ─── Tombstone collection ────────────────────────────────────

    /// Record the version a remote replica reported having applied.
    pub fn acknowledge(&mut self, replica: ReplicaId, generation: Generation, version: VersionVector) {
        if generation != self.generation || replica == self.replica {
            return;
        }
        match self.acks.iter_mut().find(|(r, _)| *r == replica) {
            Some((_, v)) => *v = version,
            None => self.acks.push((replica, version)),
        }
    }

    /// Drop acknowledgement state for a replica that left the room.
    pub fn forget(&mut self, replica: &ReplicaId) {
        self.acks.retain(|(r, _)| r != replica);
    }

    /// Physically remove tombstones once every peer has applied exactly what
    /// this replica has.
    ///
    /// At that point no operation that could still reference a tombstone is
    /// in flight, and every future insert sorts after all existing ids.
    /// Returns the number of tombstones removed.
    pub fn collect_garbage(&mut self, peers: &[ReplicaId]) -> usize {
        if !self.pending.is_empty() {
            return 0;
        }
        let quiescent = peers.iter().filter(|p| **p != self.replica).all(|peer| {
            self.acks
                .iter()
                .any(|(r, v)| r == peer && *v == self.version)
        });
        if !quiescent {
            return 0;
        }

        let before = self.elements.len();
        self.elements.retain(|e| !e.deleted);
        let removed = before - self.elements.len();
        if removed > 0 {
            debug!("collected {removed} tombstones in {}", self.generation);
        }
        removed
    }

    // ─── Internals ───────────────────────────────────────────────

    fn next_op_id(&self) -> OpId {
        OpId {
            replica: self.replica,
            seq: self.version.get(&self.replica) + 1,
        }
    }

    fn visible_id(&self, n: usize) -> Option<ItemId> {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .nth(n)
            .map(|e| e.id)
    }

    fn index_of(&self, id: &ItemId) -> Option<usize> {
        self.elements.iter().position(|e| e.id == *id)
    }

    fn is_ready(&self, op: &Operation) -> bool {
        self.version.get(&op.id.replica) + 1 == op.id.seq && self.version.dominates(&op.deps)
    }

    fn buffer(&mut self, op: Operation) {
        let queued = self
            .pending
            .iter()
            .any(|p| p.id == op.id && p.generation == op.generation);
        if !queued {
            self.pending.push(op);
        }
    }

    /// Replace all content with seed characters for `generation`.
    fn install(&mut self, generation: Generation, text: &str) {
        self.generation = generation;
        self.elements = text
            .chars()
            .enumerate()
            .map(|(i, ch)| Element {
                id: ItemId::new(i as u64 + 1, SEED_REPLICA),
                ch,
                deleted: false,
            })
            .collect();
        self.clock = self.clock.max(self.elements.len() as u64);
        self.version = VersionVector::new();
        self.acks.clear();
        self.pending.retain(|op| op.generation >= generation);
    }

    /// Apply every buffered operation that has become ready.
    fn drain_pending(&mut self) -> Result<usize, DocumentError> {
        let mut drained = 0;
        loop {
            let generation = self.generation;
            self.pending.retain(|op| {
                op.generation > generation || (op.generation == generation && !op.is_reset())
            });
            let version = &self.version;
            self.pending
                .retain(|op| op.generation != generation || !version.contains(&op.id));

            let ready = self
                .pending
                .iter()
                .position(|op| op.generation == generation && self.is_ready(op));
            match ready {
                Some(idx) => {
                    let op = self.pending.swap_remove(idx);
                    self.integrate(&op)?;
                    drained += 1;
                }
                None => return Ok(drained),
            }
        }
    }

    /// Place an operation's effect into `elements`.
    ///
    /// Callers guarantee the generation matches and dependencies are met.
    /// Every lookup is checked before anything is mutated, so a violation
    /// leaves the buffer unchanged.
    fn integrate(&mut self, op: &Operation) -> Result<(), DocumentError> {
        match &op.kind {
            OpKind::Insert { origin, first, text } => {
                let mut pos = match origin {
                    None => 0,
                    Some(id) => {
                        self.index_of(id).ok_or_else(|| {
                            DocumentError::MergeConflictImpossible(format!(
                                "insert {:?} references unknown origin {id:?}",
                                op.id
                            ))
                        })? + 1
                    }
                };
                if self.index_of(first).is_some() {
                    return Err(DocumentError::MergeConflictImpossible(format!(
                        "insert {:?} reuses existing id {first:?}",
                        op.id
                    )));
                }

                for (i, ch) in text.chars().enumerate() {
                    let id = first.offset(i as u64);
                    while pos < self.elements.len() && self.elements[pos].id > id {
                        pos += 1;
                    }
                    self.elements.insert(
                        pos,
                        Element {
                            id,
                            ch,
                            deleted: false,
                        },
                    );
                    pos += 1;
                    self.clock = self.clock.max(id.clock);
                }
            }
            OpKind::Delete { targets } => {
                let mut indices = Vec::with_capacity(targets.len());
                for target in targets {
                    let idx = self.index_of(target).ok_or_else(|| {
                        DocumentError::MergeConflictImpossible(format!(
                            "delete {:?} references unknown element {target:?}",
                            op.id
                        ))
                    })?;
                    indices.push(idx);
                }
                for idx in indices {
                    self.elements[idx].deleted = true;
                }
            }
            OpKind::Reset { .. } => {
                return Err(DocumentError::MergeConflictImpossible(format!(
                    "reset {:?} reached integration",
                    op.id
                )));
            }
        }

        self.version.set(op.id.replica, op.id.seq);
        Ok(())
    }
}
