//! # synccode-core: Replicated document model for SyncCode rooms
//!
//! The shared code buffer is a sequence CRDT: every character has a stable
//! id, operations merge deterministically, and replicas that have applied
//! the same operations show the same text regardless of arrival order.
//!
//! ## Modules
//!
//! - [`id`]: item ids, operation ids, generations, version vectors
//! - [`document`]: the replicated buffer (insert / delete / apply / reset)
//! - [`template`]: question templates and per-language starter code
//! - [`submission`]: code + hidden harness payload for the grader

pub mod document;
pub mod id;
pub mod submission;
pub mod template;

pub use document::{
    ApplyOutcome, Document, DocumentError, DocumentState, Element, OpKind, Operation,
};
pub use id::{Generation, ItemId, OpId, ReplicaId, VersionVector, SEED_REPLICA};
pub use submission::Submission;
pub use template::{Example, Language, QuestionTemplate, StarterCode, TemplateError};
