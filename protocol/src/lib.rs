//! Wire-level types for the Quill streaming session engine.
//!
//! This crate defines the named server-push event vocabulary, the decoded
//! [`StreamEvent`] union the engine reduces over, and the data types that
//! cross the engine boundary: citations, research steps, attachments, and
//! the turn rows written into the conversation history cache.

mod citations;
mod research;
mod turn;
mod wire;

pub use citations::Attachment;
pub use citations::Citation;
pub use citations::ImageCitation;
pub use research::ResearchStep;
pub use research::ResearchStepKind;
pub use research::ResearchStepStatus;
pub use turn::ClarificationChoice;
pub use turn::ClarificationOption;
pub use turn::ClarificationRequest;
pub use turn::Role;
pub use turn::TurnList;
pub use turn::TurnRecord;
pub use wire::CitationsUpdate;
pub use wire::ReasoningPayload;
pub use wire::ResponseMetadata;
pub use wire::StreamEvent;
pub use wire::WireEvent;
pub use wire::decode;
