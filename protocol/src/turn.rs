use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::citations::Attachment;
use crate::citations::Citation;
use crate::citations::ImageCitation;
use crate::research::ResearchStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One row of a conversation's turn list as stored in the history cache.
/// The cache itself is external to the engine; the engine only performs
/// functional read-modify-write patches over values of this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_index_map: Option<HashMap<u32, usize>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_citations: Vec<ImageCitation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub research_steps: Vec<ResearchStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// True while the row is still being generated (or regenerated).
    #[serde(default)]
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type TurnList = Vec<TurnRecord>;

impl TurnRecord {
    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            text: text.into(),
            reasoning: String::new(),
            citations: Vec::new(),
            citation_index_map: None,
            image_citations: Vec::new(),
            research_steps: Vec::new(),
            attachments: Vec::new(),
            pending: false,
            error: None,
        }
    }

    pub fn assistant(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            text: String::new(),
            reasoning: String::new(),
            citations: Vec::new(),
            citation_index_map: None,
            image_citations: Vec::new(),
            research_steps: Vec::new(),
            attachments: Vec::new(),
            pending: true,
            error: None,
        }
    }
}

/// A server-initiated pause asking the user to pick among options before
/// generation continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<ClarificationOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationOption {
    pub id: String,
    #[serde(default)]
    pub label: String,
}

/// The user's answer to a clarification, echoed back on the stream once the
/// server resumes generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationChoice {
    pub id: String,
    #[serde(default)]
    pub choice_id: String,
}
