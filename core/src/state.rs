use std::collections::HashMap;

use indexmap::IndexMap;
use quill_protocol::Citation;
use quill_protocol::ClarificationRequest;
use quill_protocol::ImageCitation;
use quill_protocol::ResearchStep;

/// In-memory state of one turn's streaming lifecycle. Mutated only by the
/// reducer (and the stop path); observers read by-value snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    /// Registry lookup key. A client-generated random id for turns that
    /// start before their conversation exists, otherwise the conversation's
    /// permanent id.
    pub session_key: String,

    /// Permanent conversation identity, once the server assigns or confirms
    /// one. A change away from `session_key` triggers rebinding.
    pub conversation_id: Option<String>,

    /// Identity of the assistant message being produced.
    pub turn_id: Option<String>,

    /// Answer text accumulated from ordered deltas. May run ahead of what
    /// the progressive renderer has revealed.
    pub answer_text: String,

    /// Reasoning trace accumulated from `reasoning` events.
    pub reasoning_text: String,

    /// Text currently authorized for progressive display.
    pub render_text: String,

    /// Channel this turn feeds in the progressive-reveal renderer. Fixed at
    /// creation; survives identity rebinding so the renderer's buffer is
    /// not lost mid-turn.
    pub reveal_channel: String,

    /// Research trace, merge-by-id, arrival order preserved.
    pub research_steps: IndexMap<String, ResearchStep>,

    pub citations: Vec<Citation>,

    /// Position-in-answer index -> position in `citations`. Server-provided
    /// canonical ordering; absent until the first `citations_update`.
    pub citation_index_map: Option<HashMap<u32, usize>>,

    pub image_citations: Vec<ImageCitation>,

    /// Consolidated answer that supersedes `answer_text`, set by a
    /// `citations_update` carrying one.
    pub final_answer_text: Option<String>,

    pub is_streaming: bool,
    pub is_retrying: bool,

    /// True while the turn belongs to a conversation the server has not yet
    /// assigned a permanent identity to. Cleared by the first metadata event
    /// carrying a conversation id.
    pub anonymous: bool,

    pub clarification: Option<ClarificationRequest>,
    pub awaiting_clarification: bool,

    /// Terminal latch: set once by `end`/`error`/stop, making later
    /// terminal events no-ops.
    pub ended: bool,

    /// Set by the explicit stop operation.
    pub stopped: bool,

    /// Server- or transport-provided terminal message, if the turn failed.
    pub error: Option<String>,
}

impl SessionState {
    pub fn new(session_key: impl Into<String>, is_retrying: bool) -> Self {
        let session_key = session_key.into();
        Self {
            reveal_channel: session_key.clone(),
            session_key,
            is_streaming: true,
            is_retrying,
            ..Default::default()
        }
    }

    /// A session for a turn that started before its conversation existed.
    pub fn new_anonymous(session_key: impl Into<String>) -> Self {
        Self {
            anonymous: true,
            ..Self::new(session_key, false)
        }
    }

    /// The text a finalized turn should display: the consolidated answer
    /// when the server sent one, the accumulated deltas otherwise.
    pub fn effective_answer(&self) -> &str {
        self.final_answer_text.as_deref().unwrap_or(&self.answer_text)
    }

    pub fn research_steps_ordered(&self) -> Vec<ResearchStep> {
        self.research_steps.values().cloned().collect()
    }
}
