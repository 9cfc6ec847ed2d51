//! Pure event reduction: `(session state, stream event) -> (state', effects)`.
//!
//! The reducer is the only writer of session state. It touches no engine
//! resource directly; everything outward-facing (renderer feeds, cache
//! patches, rebinding, notifications) is returned as an [`Effect`] for the
//! turn driver to execute. This keeps every merge rule testable without a
//! connection.

use quill_protocol::Attachment;
use quill_protocol::ClarificationRequest;
use quill_protocol::ReasoningPayload;
use quill_protocol::StreamEvent;
use tracing::trace;
use tracing::warn;

use crate::state::SessionState;

/// Outward-facing consequences of one reduction step.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Forward a fragment to the progressive-reveal renderer.
    Reveal(String),
    /// Ask the renderer to skip pacing and show the final text now.
    RevealFinal(String),
    /// Patch attachment metadata onto the most recent user-authored row.
    PatchAttachments(Vec<Attachment>),
    /// The server assigned a permanent conversation identity that differs
    /// from the current registry key.
    Rebind { conversation_id: String },
    /// Forward a conversation title to the external title callback.
    Title(String),
    /// Generation paused pending a user choice.
    Clarify(ClarificationRequest),
    /// The turn completed; write the finalized row into the history cache.
    Finalize,
    /// Surface one user-visible error notification.
    SurfaceError(String),
    /// Drop the speculative history-cache entry of a conversation that
    /// failed before it ever received a permanent identity.
    DiscardProvisional,
}

pub fn reduce(state: &mut SessionState, event: StreamEvent) -> Vec<Effect> {
    match event {
        StreamEvent::TextDelta(delta) => {
            state.answer_text.push_str(&delta);
            // While a clarification is pending the text is not an active
            // answer: keep accumulating, reveal nothing.
            if state.awaiting_clarification || state.ended {
                Vec::new()
            } else {
                state.render_text = state.answer_text.clone();
                vec![Effect::Reveal(delta)]
            }
        }
        StreamEvent::ReasoningDelta(payload) => {
            match payload {
                ReasoningPayload::Step { step, text } => {
                    let line = match (step, text) {
                        (Some(step), Some(text)) => format!("{step}: {text}"),
                        (Some(step), None) => step,
                        (None, Some(text)) => text,
                        (None, None) => String::new(),
                    };
                    if !line.is_empty() {
                        if !state.reasoning_text.is_empty() {
                            state.reasoning_text.push('\n');
                        }
                        state.reasoning_text.push_str(&line);
                    }
                }
                ReasoningPayload::Raw(raw) => state.reasoning_text.push_str(&raw),
            }
            Vec::new()
        }
        StreamEvent::ResearchStep(step) => {
            match state.research_steps.get_mut(&step.id) {
                Some(existing) => existing.merge_from(step),
                None => {
                    state.research_steps.insert(step.id.clone(), step);
                }
            }
            Vec::new()
        }
        StreamEvent::CitationsUpdate(update) => {
            state.citations = update.items;
            state.citation_index_map = Some(update.index_map);
            if update.answer_text.is_some() {
                state.final_answer_text = update.answer_text;
            }
            Vec::new()
        }
        StreamEvent::ImageCitationsUpdate(items) => {
            state.image_citations = items;
            Vec::new()
        }
        StreamEvent::AttachmentsUpdate(items) => vec![Effect::PatchAttachments(items)],
        StreamEvent::Metadata(meta) => {
            if let Some(turn_id) = meta.turn_id {
                state.turn_id = Some(turn_id);
            }
            match meta.conversation_id {
                Some(id) if id != state.session_key => {
                    state.conversation_id = Some(id.clone());
                    state.anonymous = false;
                    vec![Effect::Rebind { conversation_id: id }]
                }
                Some(id) => {
                    state.conversation_id = Some(id);
                    state.anonymous = false;
                    Vec::new()
                }
                None => Vec::new(),
            }
        }
        StreamEvent::TitleUpdate(title) => vec![Effect::Title(title)],
        StreamEvent::ClarificationRequested(request) => {
            state.clarification = Some(request.clone());
            state.awaiting_clarification = true;
            state.is_streaming = false;
            vec![Effect::Clarify(request)]
        }
        StreamEvent::ClarificationProvided(_choice) => {
            state.clarification = None;
            state.awaiting_clarification = false;
            if !state.ended {
                state.is_streaming = true;
            }
            Vec::new()
        }
        StreamEvent::End => {
            if state.ended {
                return Vec::new();
            }
            state.ended = true;
            state.is_streaming = false;
            state.awaiting_clarification = false;
            let final_text = state.effective_answer().to_string();
            state.render_text = final_text.clone();
            vec![Effect::RevealFinal(final_text), Effect::Finalize]
        }
        StreamEvent::Error(message) => {
            if state.ended {
                return Vec::new();
            }
            state.ended = true;
            state.is_streaming = false;
            state.awaiting_clarification = false;
            state.error = Some(message.clone());
            let mut effects = vec![
                Effect::RevealFinal(state.effective_answer().to_string()),
                Effect::SurfaceError(message),
            ];
            if state.anonymous {
                effects.push(Effect::DiscardProvisional);
            }
            effects
        }
        StreamEvent::Malformed { event, raw } => {
            warn!(event = %event, len = raw.len(), "dropping undecodable stream payload");
            Vec::new()
        }
        StreamEvent::Unknown { event } => {
            trace!(event = %event, "ignoring unrecognized stream event");
            Vec::new()
        }
    }
}
