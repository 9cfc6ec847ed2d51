//! Seams to the engine's external collaborators. Everything the engine
//! needs from the surrounding application is expressed as a trait here, and
//! every trait has an in-memory double in the test suites.

use async_trait::async_trait;
use quill_protocol::TurnList;

use crate::error::Result;

/// Source of the credential attached to stream opens, with the one-shot
/// refresh endpoint used when an open fails.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current credential as an `Authorization` header value, if any.
    fn credentials(&self) -> Option<String>;

    async fn refresh(&self) -> Result<()>;
}

/// The conversation history cache: a key-value store of turn lists. The
/// engine patches it but does not own it; other writers may race, so every
/// mutation is a functional update over the latest value, never a blind
/// overwrite.
pub trait HistoryCache: Send + Sync {
    fn read(&self, key: &str) -> Option<TurnList>;

    /// Read-modify-write under the cache's own consistency domain.
    fn write(&self, key: &str, patch: &dyn Fn(TurnList) -> TurnList);

    fn delete(&self, key: &str);
}

/// The progressive text-reveal renderer. The engine feeds it complete
/// chunks and asks it to flush at end of stream; pacing is its concern.
pub trait RevealQueue: Send + Sync {
    fn enqueue(&self, channel: &str, fragment: &str);

    /// Skip pacing and show `final_text` now.
    fn flush_immediately(&self, channel: &str, final_text: &str);

    /// Stop revealing; whatever is on screen stays.
    fn stop(&self, channel: &str);
}

/// Server-side turn control outside the stream itself.
#[async_trait]
pub trait TurnApi: Send + Sync {
    /// Ask the backend to halt generation. Best-effort and idempotent;
    /// failures are logged, never block local cleanup.
    async fn stop_generation(&self, conversation_id: &str) -> Result<()>;

    /// Answer a clarification. Synchronous success/failure; the resumed
    /// stream delivers the actual state flip.
    async fn respond_clarification(
        &self,
        conversation_id: &str,
        clarification_id: &str,
        choice_id: &str,
    ) -> Result<()>;
}

/// User-visible error notifications. One per terminal failure, never more.
pub trait Notifier: Send + Sync {
    fn notify_error(&self, message: &str);
}

/// One-shot navigation from the anonymous placeholder route to the
/// permanent conversation route after rebinding.
pub trait Navigator: Send + Sync {
    fn navigate_to_conversation(&self, conversation_id: &str);
}

/// Conversation title updates; not stored on the session.
pub trait TitleSink: Send + Sync {
    fn title_updated(&self, key: &str, title: &str);
}
