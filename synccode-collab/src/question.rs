//! Where question templates come from.
//!
//! The session only ever sees a fetched [`QuestionTemplate`]; the question
//! service behind it is an implementation detail of whoever embeds the room.

use async_trait::async_trait;
use std::collections::HashMap;

use synccode_core::{QuestionTemplate, TemplateError};

#[async_trait]
pub trait QuestionSource: Send + Sync {
    async fn fetch(&self, question_id: &str) -> Result<QuestionTemplate, TemplateError>;
}

/// Templates held in memory, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct StaticQuestionSource {
    templates: HashMap<String, QuestionTemplate>,
}

impl StaticQuestionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, template: QuestionTemplate) -> Self {
        self.insert(template);
        self
    }

    pub fn insert(&mut self, template: QuestionTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    /// Load a JSON array of templates in the question service's format.
    pub fn from_json_array(json: &str) -> Result<Self, TemplateError> {
        let templates: Vec<QuestionTemplate> =
            serde_json::from_str(json).map_err(|e| TemplateError::Decode(e.to_string()))?;
        let mut source = Self::new();
        for template in templates {
            source.insert(template);
        }
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[async_trait]
impl QuestionSource for StaticQuestionSource {
    async fn fetch(&self, question_id: &str) -> Result<QuestionTemplate, TemplateError> {
        self.templates
            .get(question_id)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(question_id.to_string()))
    }
}
