use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::citations::Attachment;
use crate::citations::Citation;
use crate::citations::ImageCitation;
use crate::research::ResearchStep;
use crate::turn::ClarificationChoice;
use crate::turn::ClarificationRequest;

/// One named event as delivered by the push stream: an event name plus the
/// raw UTF-8 payload. Deltas carry raw text; structured events carry JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEvent {
    pub event: String,
    pub data: String,
}

impl WireEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// A `reasoning` payload. The server interleaves plain text fragments with
/// JSON-encoded step lines on the same event name.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningPayload {
    /// Parsed `{"step": ..., "text": ...}` line.
    Step {
        step: Option<String>,
        text: Option<String>,
    },
    /// Anything that did not parse as a step object.
    Raw(String),
}

/// Consolidated citations for an answer. `answer_text`, when present,
/// supersedes the incrementally accumulated answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationsUpdate {
    #[serde(default)]
    pub items: Vec<Citation>,
    #[serde(default)]
    pub index_map: HashMap<u32, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,
}

/// Identity assignment for an in-flight turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub turn_id: Option<String>,
}

/// The decoded event union the reducer consumes. Decoding is total: a
/// structured payload that fails to parse becomes [`StreamEvent::Malformed`]
/// rather than an error, so one bad frame can never fail a session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(ReasoningPayload),
    ResearchStep(ResearchStep),
    CitationsUpdate(CitationsUpdate),
    ImageCitationsUpdate(Vec<ImageCitation>),
    AttachmentsUpdate(Vec<Attachment>),
    Metadata(ResponseMetadata),
    TitleUpdate(String),
    ClarificationRequested(ClarificationRequest),
    ClarificationProvided(ClarificationChoice),
    End,
    Error(String),
    Malformed { event: String, raw: String },
    Unknown { event: String },
}

#[derive(Debug, Deserialize)]
struct ReasoningLine {
    step: Option<String>,
    text: Option<String>,
}

fn structured<T, F>(event: &str, data: String, wrap: F) -> StreamEvent
where
    T: for<'de> Deserialize<'de>,
    F: FnOnce(T) -> StreamEvent,
{
    match serde_json::from_str::<T>(&data) {
        Ok(payload) => wrap(payload),
        Err(err) => {
            trace!("undecodable {event} payload: {err}");
            StreamEvent::Malformed {
                event: event.to_string(),
                raw: data,
            }
        }
    }
}

/// Map a named wire event to the reducer vocabulary.
pub fn decode(wire: WireEvent) -> StreamEvent {
    let WireEvent { event, data } = wire;
    match event.as_str() {
        "response_update" => StreamEvent::TextDelta(data),
        "reasoning" => match serde_json::from_str::<ReasoningLine>(&data) {
            Ok(line) if line.step.is_some() || line.text.is_some() => {
                StreamEvent::ReasoningDelta(ReasoningPayload::Step {
                    step: line.step,
                    text: line.text,
                })
            }
            _ => StreamEvent::ReasoningDelta(ReasoningPayload::Raw(data)),
        },
        "deep_research_step" => structured(&event, data, StreamEvent::ResearchStep),
        "citations_update" => structured(&event, data, StreamEvent::CitationsUpdate),
        "image_citation_update" => structured(&event, data, StreamEvent::ImageCitationsUpdate),
        "attachment_update" => structured(&event, data, StreamEvent::AttachmentsUpdate),
        "response_metadata" => structured(&event, data, StreamEvent::Metadata),
        "title_update" => StreamEvent::TitleUpdate(unwrap_text(data)),
        "clarification_requested" => {
            structured(&event, data, StreamEvent::ClarificationRequested)
        }
        "clarification_provided" => structured(&event, data, StreamEvent::ClarificationProvided),
        "end" => StreamEvent::End,
        "error" => StreamEvent::Error(unwrap_message(data)),
        _ => StreamEvent::Unknown { event },
    }
}

/// `title_update` payloads arrive either as a raw string or as a JSON
/// string / `{"title": ...}` object.
fn unwrap_text(data: String) -> String {
    match serde_json::from_str::<Value>(&data) {
        Ok(Value::String(s)) => s,
        Ok(Value::Object(map)) => match map.get("title").and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => data,
        },
        _ => data,
    }
}

/// Server error payloads carry either a bare message or `{"message": ...}`.
/// The message is surfaced to the user verbatim.
fn unwrap_message(data: String) -> String {
    match serde_json::from_str::<Value>(&data) {
        Ok(Value::String(s)) => s,
        Ok(Value::Object(map)) => {
            let msg = map
                .get("message")
                .or_else(|| map.get("error"))
                .and_then(Value::as_str);
            match msg {
                Some(s) => s.to_string(),
                None => data,
            }
        }
        _ => data,
    }
}
