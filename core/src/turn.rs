//! Turn orchestration: the engine object applications construct at root
//! scope, plus the primary and retry turn entry points. Both paths share
//! one stream driver (`driver::TurnDriver`); they differ only in session
//! lifetime and in how aggressively they patch the history cache.

use std::sync::Arc;

use quill_protocol::Attachment;
use quill_protocol::TurnRecord;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::client::SseTransport;
use crate::client::StreamClient;
use crate::client::StreamRequest;
use crate::client::Transport;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::error::Result;
use crate::external::CredentialStore;
use crate::external::HistoryCache;
use crate::external::Navigator;
use crate::external::Notifier;
use crate::external::RevealQueue;
use crate::external::TitleSink;
use crate::external::TurnApi;
use crate::registry::SessionRegistry;
use crate::state::SessionState;
use crate::subscribers::Callback;
use crate::subscribers::Subscription;
use crate::subscribers::SubscriptionHub;

mod driver;

use driver::TurnDriver;
use driver::TurnMode;

/// Message shown when the stream dies without a server-provided payload.
pub(crate) const GENERIC_STREAM_ERROR: &str =
    "Connection to the assistant was lost. Please try again.";

/// Message shown when a turn cannot start at all.
const START_FAILED_MESSAGE: &str = "Something went wrong starting this answer. Please try again.";

/// A brand-new conversation turn. `message` arrives already serialized by
/// the rich-text message serializer; the engine treats it as opaque.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: Option<String>,
    pub message: String,
    pub tools: Vec<String>,
    pub attachments: Vec<Attachment>,
    pub model: Option<String>,
    /// Whether rebinding may issue a one-time navigation to the permanent
    /// conversation route.
    pub allow_navigation: bool,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            message: message.into(),
            tools: Vec::new(),
            attachments: Vec::new(),
            model: None,
            allow_navigation: true,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Regeneration of one existing assistant turn.
#[derive(Debug, Clone)]
pub struct RetryRequest {
    pub conversation_id: String,
    pub turn_id: String,
    pub model: Option<String>,
}

/// Everything the engine needs from the surrounding application.
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialStore>,
    pub cache: Arc<dyn HistoryCache>,
    pub reveal: Arc<dyn RevealQueue>,
    pub api: Arc<dyn TurnApi>,
    pub notifier: Arc<dyn Notifier>,
    pub navigator: Arc<dyn Navigator>,
    pub titles: Arc<dyn TitleSink>,
}

/// The streaming session engine. One instance per application root; owns
/// the session registry and subscription hub, and spawns one driver task
/// per in-flight turn.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    hub: Arc<SubscriptionHub>,
    client: Arc<StreamClient>,
    ext: Collaborators,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        ext: Collaborators,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(SubscriptionHub::new(Arc::clone(&registry)));
        let client = Arc::new(StreamClient::new(
            transport,
            Arc::clone(&ext.credentials),
            config.clone(),
        ));
        Arc::new(Self {
            config,
            registry,
            hub,
            client,
            ext,
        })
    }

    /// Construct with the production SSE transport.
    pub fn with_sse(config: EngineConfig, ext: Collaborators) -> Result<Arc<Self>> {
        let transport = Arc::new(SseTransport::new(&config)?);
        Ok(Self::new(config, transport, ext))
    }

    /// Start a brand-new conversation turn. Refuses while a turn is already
    /// streaming for the target conversation. Returns the session key
    /// observers subscribe under (the conversation id, or a client-minted
    /// draft key for a conversation that does not exist yet).
    pub async fn start_turn(&self, request: TurnRequest) -> Result<String> {
        let anonymous = request.conversation_id.is_none();
        let session_key = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| format!("draft-{}", Uuid::new_v4()));

        let state = if anonymous {
            SessionState::new_anonymous(&session_key)
        } else {
            SessionState::new(&session_key, false)
        };
        let slot = self.registry.create(state)?;

        // Speculative rows so the conversation view has something to show
        // while the answer streams. The assistant row stays pending until
        // the finalize step rewrites it.
        let assistant_row_id = format!("assistant-{}", Uuid::new_v4());
        let user_row_id = format!("user-{}", Uuid::new_v4());
        slot.set_cache_row(Some(assistant_row_id.clone()));
        {
            let user_row_id = user_row_id.clone();
            let message = request.message.clone();
            let attachments = request.attachments.clone();
            let assistant_row_id = assistant_row_id.clone();
            self.ext.cache.write(&session_key, &move |mut turns| {
                let mut user = TurnRecord::user(user_row_id.clone(), message.clone());
                user.attachments = attachments.clone();
                turns.push(user);
                turns.push(TurnRecord::assistant(assistant_row_id.clone()));
                turns
            });
        }

        let stream_request = self.primary_stream_request(&request, &session_key)?;
        let stream = match self.client.open_stream(&stream_request).await {
            Ok(stream) => stream,
            Err(err) => {
                slot.with_state(|state| {
                    state.is_streaming = false;
                    state.ended = true;
                    state.error = Some(err.to_string());
                });
                self.hub.notify(&session_key);
                self.ext.notifier.notify_error(START_FAILED_MESSAGE);
                if anonymous {
                    self.ext.cache.delete(&session_key);
                } else {
                    // The turn never started; drop its speculative rows.
                    let user_id = user_row_id.clone();
                    let assistant_id = assistant_row_id.clone();
                    self.ext.cache.write(&session_key, &move |mut turns| {
                        turns.retain(|row| row.id != user_id && row.id != assistant_id);
                        turns
                    });
                }
                return Err(err);
            }
        };

        let driver = TurnDriver::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.hub),
            self.ext.clone(),
            session_key.clone(),
            session_key.clone(),
            TurnMode::Primary {
                allow_navigation: request.allow_navigation,
                assistant_row_id,
            },
        );
        let handle = tokio::spawn(driver.run(stream));
        slot.set_abort(handle.abort_handle());
        Ok(session_key)
    }

    /// Regenerate one existing assistant turn. The session is ephemeral:
    /// created here, removed from the registry on any terminal event. The
    /// targeted cache row carries `pending = true` from before the
    /// connection opens until the terminal path clears it, transport
    /// failures included, so a "regenerating" indicator cannot stick.
    pub async fn retry_turn(&self, request: RetryRequest) -> Result<String> {
        let RetryRequest {
            conversation_id,
            turn_id,
            model,
        } = request;
        let session_key = format!("retry-{turn_id}");

        // Regenerate in place, unless the original failed and must be
        // replaced by a fresh row inserted right after it.
        let original_failed = self
            .ext
            .cache
            .read(&conversation_id)
            .unwrap_or_default()
            .iter()
            .any(|row| row.id == turn_id && row.error.is_some());
        let target_row_id = if original_failed {
            format!("assistant-{}", Uuid::new_v4())
        } else {
            turn_id.clone()
        };

        let mut state = SessionState::new(&session_key, true);
        state.conversation_id = Some(conversation_id.clone());
        state.turn_id = Some(turn_id.clone());
        let slot = self.registry.create(state)?;
        slot.set_cache_row(Some(target_row_id.clone()));

        {
            let original_id = turn_id.clone();
            let target_id = target_row_id.clone();
            self.ext.cache.write(&conversation_id, &move |mut turns| {
                if let Some(row) = turns.iter_mut().find(|row| row.id == target_id) {
                    row.pending = true;
                    row.error = None;
                    row.text.clear();
                    row.reasoning.clear();
                    row.citations.clear();
                    row.citation_index_map = None;
                    row.image_citations.clear();
                    row.research_steps.clear();
                } else {
                    let position = turns
                        .iter()
                        .position(|row| row.id == original_id)
                        .map_or(turns.len(), |index| index + 1);
                    turns.insert(position, TurnRecord::assistant(target_id.clone()));
                }
                turns
            });
        }

        let stream_request = self.retry_stream_request(&conversation_id, &turn_id, model.as_deref())?;
        let stream = match self.client.open_stream(&stream_request).await {
            Ok(stream) => stream,
            Err(err) => {
                let target_id = target_row_id.clone();
                self.ext.cache.write(&conversation_id, &move |mut turns| {
                    if let Some(row) = turns.iter_mut().find(|row| row.id == target_id) {
                        row.pending = false;
                    }
                    turns
                });
                self.registry.remove(&session_key);
                self.ext.notifier.notify_error(START_FAILED_MESSAGE);
                return Err(err);
            }
        };

        let driver = TurnDriver::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.hub),
            self.ext.clone(),
            session_key.clone(),
            conversation_id,
            TurnMode::Retry { target_row_id },
        );
        let handle = tokio::spawn(driver.run(stream));
        slot.set_abort(handle.abort_handle());
        Ok(session_key)
    }

    /// Stop an in-flight turn: close the connection, freeze the revealed
    /// text at what has accumulated, and tell the server to halt generation
    /// (best-effort). The session stays readable afterwards; retry sessions
    /// are single-use and removed.
    pub fn stop(&self, key: &str) -> Result<()> {
        let slot = self
            .registry
            .get(key)
            .ok_or_else(|| EngineError::UnknownSession(key.to_string()))?;
        if let Some(abort) = slot.take_abort() {
            abort.abort();
        }

        let (channel, accumulated, conversation, is_retrying) = slot.with_state(|state| {
            state.is_streaming = false;
            state.ended = true;
            state.stopped = true;
            state.awaiting_clarification = false;
            (
                state.reveal_channel.clone(),
                state.answer_text.clone(),
                state
                    .conversation_id
                    .clone()
                    .unwrap_or_else(|| state.session_key.clone()),
                state.is_retrying,
            )
        });

        // No further reveal; show exactly what has accumulated so far.
        self.ext.reveal.stop(&channel);
        self.ext.reveal.flush_immediately(&channel, &accumulated);
        self.hub.notify(key);

        // The row this turn was writing must stop claiming to be pending,
        // and keeps the partial text the user chose to freeze.
        if let Some(row_id) = slot.cache_row() {
            let text = accumulated.clone();
            self.ext.cache.write(&conversation, &move |mut turns| {
                if let Some(row) = turns.iter_mut().find(|row| row.id == row_id) {
                    row.pending = false;
                    row.text = text.clone();
                }
                turns
            });
        }
        if is_retrying {
            self.registry.remove(key);
        }

        let api = Arc::clone(&self.ext.api);
        tokio::spawn(async move {
            if let Err(err) = api.stop_generation(&conversation).await {
                warn!("failed to notify server of stop: {err}");
            }
        });
        Ok(())
    }

    /// Answer a pending clarification. The synchronous API result reports
    /// acceptance; the resumed stream delivers the actual state flip, so
    /// the reducer stays the only writer of session state.
    pub async fn respond_clarification(
        &self,
        key: &str,
        clarification_id: &str,
        choice_id: &str,
    ) -> Result<()> {
        let slot = self
            .registry
            .get(key)
            .ok_or_else(|| EngineError::UnknownSession(key.to_string()))?;
        let conversation = slot.with_state(|state| {
            state
                .conversation_id
                .clone()
                .unwrap_or_else(|| state.session_key.clone())
        });
        self.ext
            .api
            .respond_clarification(&conversation, clarification_id, choice_id)
            .await
            .map_err(|err| EngineError::ClarificationRejected(err.to_string()))
    }

    pub fn subscribe(&self, key: &str, callback: Callback) -> Subscription {
        self.hub.subscribe(key, callback)
    }

    pub fn snapshot(&self, key: &str) -> Option<SessionState> {
        self.registry.snapshot(key)
    }

    /// Explicitly delete a finished session from the registry.
    pub fn remove_session(&self, key: &str) {
        self.registry.remove(key);
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = Url::parse(&self.config.base_url)
            .map_err(|err| EngineError::InvalidConfig(err.to_string()))?;
        base.join(path)
            .map_err(|err| EngineError::InvalidConfig(err.to_string()))
    }

    fn primary_stream_request(
        &self,
        request: &TurnRequest,
        session_key: &str,
    ) -> Result<StreamRequest> {
        let mut stream_request = StreamRequest::new(self.endpoint("/api/conversation/stream")?)
            .param("message", &request.message);
        if let Some(conversation_id) = &request.conversation_id {
            stream_request = stream_request.param("conversation_id", conversation_id);
        } else {
            stream_request = stream_request.param("draft_id", session_key);
        }
        if !request.tools.is_empty() {
            stream_request = stream_request.param("tools", request.tools.join(","));
        }
        if !request.attachments.is_empty() {
            stream_request =
                stream_request.param("attachments", serde_json::to_string(&request.attachments)?);
        }
        if let Some(model) = &request.model {
            stream_request = stream_request.param("model", model);
        }
        Ok(stream_request)
    }

    fn retry_stream_request(
        &self,
        conversation_id: &str,
        turn_id: &str,
        model: Option<&str>,
    ) -> Result<StreamRequest> {
        let mut stream_request = StreamRequest::new(self.endpoint("/api/conversation/retry")?)
            .param("conversation_id", conversation_id)
            .param("turn_id", turn_id);
        if let Some(model) = model {
            stream_request = stream_request.param("model", model);
        }
        Ok(stream_request)
    }
}
