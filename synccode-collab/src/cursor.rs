//! Remote cursor decorations derived from awareness state.
//!
//! The projection owns no truth of its own: every refresh rebuilds the whole
//! decoration set from the tracker, so a participant that jumped or was
//! evicted never leaves a stale marker behind.

use std::collections::BTreeMap;

use crate::awareness::{AwarenessState, CursorColor};
use crate::protocol::ParticipantId;

/// Data needed to render a single remote cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorDecoration {
    pub participant_id: ParticipantId,
    pub label: String,
    pub color: CursorColor,
    /// Character offset, clamped to the current buffer.
    pub offset: usize,
    /// Zero-based line of `offset`.
    pub line: usize,
    /// Zero-based column (in characters) of `offset`.
    pub column: usize,
}

#[derive(Debug, Default)]
pub struct CursorProjection {
    decorations: BTreeMap<ParticipantId, CursorDecoration>,
}

impl CursorProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all decorations with ones computed from `states` against `text`.
    pub fn refresh<'a>(&mut self, states: impl IntoIterator<Item = &'a AwarenessState>, text: &str) {
        let len = text.chars().count();
        self.decorations = states
            .into_iter()
            .map(|state| {
                let offset = state.cursor_offset.min(len);
                let (line, column) = line_column(text, offset);
                let decoration = CursorDecoration {
                    participant_id: state.participant_id,
                    label: state.display_name.clone(),
                    color: state.color,
                    offset,
                    line,
                    column,
                };
                (state.participant_id, decoration)
            })
            .collect();
    }

    /// Drop the decoration of a participant that left.
    pub fn remove(&mut self, id: &ParticipantId) -> bool {
        self.decorations.remove(id).is_some()
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&CursorDecoration> {
        self.decorations.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CursorDecoration> {
        self.decorations.values()
    }

    pub fn len(&self) -> usize {
        self.decorations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decorations.is_empty()
    }

    pub fn clear(&mut self) {
        self.decorations.clear();
    }
}

fn line_column(text: &str, offset: usize) -> (usize, usize) {
    let mut line = 0;
    let mut column = 0;
    for ch in text.chars().take(offset) {
        if ch == '\n' {
            line += 1;
            column = 0;
        } else {
            column += 1;
        }
    }
    (line, column)
}
