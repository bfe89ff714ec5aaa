//! Payload handed to the grading backend when the room runs its code.

use serde::{Deserialize, Serialize};

use crate::template::Language;

/// `{ code, language, roomId, questionId }` as the grading service expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub code: String,
    pub language: Language,
    pub room_id: String,
    pub question_id: String,
}

impl Submission {
    /// Join the user's buffer with the hidden test harness.
    pub fn assemble(
        user_code: &str,
        hidden_code: &str,
        language: Language,
        room_id: impl Into<String>,
        question_id: impl Into<String>,
    ) -> Self {
        Self {
            code: format!("{user_code}\n{hidden_code}").trim().to_string(),
            language,
            room_id: room_id.into(),
            question_id: question_id.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
