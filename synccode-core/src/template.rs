//! Question templates: immutable reference data used to seed the document.
//!
//! Templates arrive as JSON from the question service, in this shape:
//!
//! ```text
//! {
//!   "_id": "...", "title": "...", "description": "...",
//!   "constraints": ["..."],
//!   "example": [{ "input": "...", "output": "...", "explanation": "..." }],
//!   "defaultcode": {
//!     "python": { "user": ["line", ...], "hidden": ["line", ...] },
//!     "java":   { "user": [...],         "hidden": [...] }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("question {question} has no starter code for {language}")]
    MissingLanguage { question: String, language: Language },
    #[error("unknown language: {0}")]
    UnknownLanguage(String),
    #[error("question not found: {0}")]
    NotFound(String),
    #[error("invalid template: {0}")]
    Decode(String),
}

/// Editing language of the shared buffer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    Java,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::Java];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            other => Err(TemplateError::UnknownLanguage(other.to_string())),
        }
    }
}

/// Starter code for one language, stored line by line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarterCode {
    #[serde(default)]
    pub user: Vec<String>,
    /// Test harness appended to the user's code on submission.
    #[serde(default)]
    pub hidden: Vec<String>,
}

impl StarterCode {
    pub fn user_code(&self) -> String {
        self.user.join("\n")
    }

    pub fn hidden_code(&self) -> String {
        self.hidden.join("\n")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub explanation: String,
}

/// A problem as served by the question source. Never mutated by the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionTemplate {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default, rename = "example")]
    pub examples: Vec<Example>,
    #[serde(default, rename = "defaultcode")]
    pub starter_code: BTreeMap<Language, StarterCode>,
}

impl QuestionTemplate {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            category: String::new(),
            difficulty: String::new(),
            constraints: Vec::new(),
            examples: Vec::new(),
            starter_code: BTreeMap::new(),
        }
    }

    /// Builder-style helper for attaching starter code.
    pub fn with_starter(mut self, language: Language, user: &str, hidden: &str) -> Self {
        self.starter_code.insert(
            language,
            StarterCode {
                user: user.lines().map(str::to_string).collect(),
                hidden: hidden.lines().map(str::to_string).collect(),
            },
        );
        self
    }

    /// Parse a template from the question service's JSON.
    pub fn from_json(json: &str) -> Result<Self, TemplateError> {
        serde_json::from_str(json).map_err(|e| TemplateError::Decode(e.to_string()))
    }

    pub fn starter(&self, language: Language) -> Result<&StarterCode, TemplateError> {
        self.starter_code
            .get(&language)
            .ok_or_else(|| TemplateError::MissingLanguage {
                question: self.id.clone(),
                language,
            })
    }

    /// The code the shared buffer is seeded with for `language`.
    pub fn user_code(&self, language: Language) -> Result<String, TemplateError> {
        Ok(self.starter(language)?.user_code())
    }

    pub fn hidden_code(&self, language: Language) -> Result<String, TemplateError> {
        Ok(self.starter(language)?.hidden_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_SUM: &str = r#"{
        "_id": "64f1",
        "title": "Two Sum",
        "description": "Return indices of the two numbers adding up to target.",
        "category": "Array",
        "difficulty": "Easy",
        "constraints": ["2 <= nums.length <= 10^4"],
        "example": [{ "input": "[2,7,11,15], 9", "output": "[0,1]", "explanation": "2 + 7 = 9" }],
        "defaultcode": {
            "python": {
                "user": ["class Solution:", "    def twoSum(self, nums, target):", "        pass"],
                "hidden": ["print(Solution().twoSum([2,7], 9))"]
            },
            "java": {
                "user": ["class Solution {", "}"],
                "hidden": []
            }
        }
    }"#;

    #[test]
    fn test_parse_question_json() {
        let q = QuestionTemplate::from_json(TWO_SUM).unwrap();
        assert_eq!(q.id, "64f1");
        assert_eq!(q.title, "Two Sum");
        assert_eq!(q.examples.len(), 1);
        assert_eq!(q.constraints.len(), 1);
        assert_eq!(
            q.user_code(Language::Python).unwrap(),
            "class Solution:\n    def twoSum(self, nums, target):\n        pass"
        );
        assert_eq!(q.user_code(Language::Java).unwrap(), "class Solution {\n}");
        assert_eq!(q.hidden_code(Language::Java).unwrap(), "");
    }

    #[test]
    fn test_missing_language() {
        let q = QuestionTemplate::new("q1", "Empty").with_starter(Language::Python, "pass", "");
        let err = q.user_code(Language::Java).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingLanguage {
                question: "q1".into(),
                language: Language::Java
            }
        );
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            QuestionTemplate::from_json("{ not json"),
            Err(TemplateError::Decode(_))
        ));
    }

    #[test]
    fn test_default_language_is_python() {
        assert_eq!(Language::default(), Language::Python);
    }

    #[test]
    fn test_language_parse_and_display() {
        assert_eq!("Python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!(" java ".parse::<Language>().unwrap(), Language::Java);
        assert!("cobol".parse::<Language>().is_err());
        assert_eq!(Language::Java.to_string(), "java");
    }
}
