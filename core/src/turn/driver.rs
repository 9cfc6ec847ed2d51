//! The shared stream driver behind both turn controllers. Consumes one
//! live event stream, reduces each event into session state, executes the
//! resulting effects against the collaborators, and notifies subscribers
//! after every change. Primary and retry turns differ only in [`TurnMode`].

use std::sync::Arc;

use quill_protocol::Attachment;
use quill_protocol::Role;
use quill_protocol::StreamEvent;
use quill_protocol::TurnRecord;
use tracing::debug;
use tracing::warn;

use crate::client::EventStream;
use crate::reducer::Effect;
use crate::reducer::reduce;
use crate::registry::SessionHandle;
use crate::registry::SessionRegistry;
use crate::state::SessionState;
use crate::subscribers::SubscriptionHub;
use crate::turn::Collaborators;
use crate::turn::GENERIC_STREAM_ERROR;

pub(super) enum TurnMode {
    Primary {
        allow_navigation: bool,
        /// Provisional id of the speculative assistant row; the finalize
        /// step rewrites it under the server-assigned turn id.
        assistant_row_id: String,
    },
    Retry {
        /// Cache row every update is patched into: the original turn id, or
        /// a freshly minted replacement inserted after a failed original.
        target_row_id: String,
    },
}

pub(super) struct TurnDriver {
    registry: Arc<SessionRegistry>,
    hub: Arc<SubscriptionHub>,
    ext: Collaborators,
    /// Current registry key; moves from the draft key to the permanent
    /// conversation id on rebinding.
    key: String,
    /// History-cache key the driver patches. For primary turns this tracks
    /// `key`; for retries it is the conversation id throughout.
    cache_key: String,
    /// Renderer channel, fixed for the turn's lifetime.
    channel: String,
    mode: TurnMode,
}

impl TurnDriver {
    pub(super) fn new(
        registry: Arc<SessionRegistry>,
        hub: Arc<SubscriptionHub>,
        ext: Collaborators,
        key: String,
        cache_key: String,
        mode: TurnMode,
    ) -> Self {
        Self {
            registry,
            hub,
            ext,
            channel: key.clone(),
            key,
            cache_key,
            mode,
        }
    }

    pub(super) async fn run(mut self, mut events: EventStream) {
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    // A dropped transport mid-stream carries no server
                    // payload; surface the generic message instead.
                    debug!("stream failed mid-turn: {err}");
                    StreamEvent::Error(GENERIC_STREAM_ERROR.to_string())
                }
            };
            let terminal = matches!(event, StreamEvent::End | StreamEvent::Error(_));

            let Some(slot) = self.registry.get(&self.key) else {
                // Session was deleted out from under the turn; stop quietly.
                return;
            };
            let effects = slot.with_state(|state| reduce(state, event));
            self.apply_effects(&slot, effects);
            if let TurnMode::Retry { .. } = self.mode {
                self.patch_retry_row(&slot);
            }
            self.hub.notify(&self.key);

            if terminal {
                self.finish_terminal(&slot);
                return;
            }
        }

        // The channel closed without a terminal event (pump died or the
        // task feeding it was dropped). Same treatment as a transport drop.
        if let Some(slot) = self.registry.get(&self.key)
            && !slot.snapshot().ended
        {
            let effects = slot.with_state(|state| {
                reduce(state, StreamEvent::Error(GENERIC_STREAM_ERROR.to_string()))
            });
            self.apply_effects(&slot, effects);
            if let TurnMode::Retry { .. } = self.mode {
                self.patch_retry_row(&slot);
            }
            self.hub.notify(&self.key);
            self.finish_terminal(&slot);
        }
    }

    fn apply_effects(&mut self, slot: &SessionHandle, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Reveal(fragment) => {
                    self.ext.reveal.enqueue(&self.channel, &fragment);
                }
                Effect::RevealFinal(text) => {
                    self.ext.reveal.flush_immediately(&self.channel, &text);
                }
                Effect::PatchAttachments(items) => self.patch_attachments(items),
                Effect::Rebind { conversation_id } => self.rebind(conversation_id),
                Effect::Title(title) => {
                    self.ext.titles.title_updated(&self.key, &title);
                }
                Effect::Clarify(_) => {
                    // State carries the pause; subscribers are notified
                    // after every event regardless.
                }
                Effect::Finalize => self.finalize(slot),
                Effect::SurfaceError(message) => {
                    self.ext.notifier.notify_error(&message);
                }
                Effect::DiscardProvisional => {
                    self.ext.cache.delete(&self.cache_key);
                }
            }
        }
    }

    /// Attachment updates target the most recent user-authored row.
    fn patch_attachments(&self, items: Vec<Attachment>) {
        self.ext.cache.write(&self.cache_key, &move |mut turns| {
            if let Some(row) = turns
                .iter_mut()
                .rev()
                .find(|row| row.role == Role::User)
            {
                row.attachments = items.clone();
            }
            turns
        });
    }

    /// Migrate the session, its subscribers, and any provisional cache
    /// entry from the draft key to the permanent conversation id. Happens
    /// at most once per turn: the reducer only emits the effect while the
    /// key still differs.
    fn rebind(&mut self, conversation_id: String) {
        let old_key = self.key.clone();
        if let Err(err) = self.registry.rename(&old_key, &conversation_id) {
            warn!("identity rebinding failed for {old_key}: {err}");
            return;
        }
        self.hub.rename(&old_key, &conversation_id);

        if self.cache_key == old_key {
            if let Some(provisional) = self.ext.cache.read(&old_key) {
                self.ext.cache.write(&conversation_id, &move |mut turns| {
                    turns.extend(provisional.clone());
                    turns
                });
                self.ext.cache.delete(&old_key);
            }
            self.cache_key = conversation_id.clone();
        }

        if let TurnMode::Primary {
            allow_navigation: true,
            ..
        } = self.mode
        {
            self.ext.navigator.navigate_to_conversation(&conversation_id);
        }

        self.key = conversation_id;
        // Re-poke observers so they re-resolve under the new key.
        self.hub.notify(&self.key);
    }

    /// Rewrite the speculative assistant row as the finalized turn, keyed
    /// by the server-assigned turn id when one arrived. Lookup covers both
    /// the final and the provisional id, so a repeated finalize can never
    /// append a duplicate row.
    fn finalize(&self, slot: &SessionHandle) {
        let TurnMode::Primary {
            assistant_row_id, ..
        } = &self.mode
        else {
            return;
        };
        let state = slot.snapshot();
        let final_id = state
            .turn_id
            .clone()
            .unwrap_or_else(|| assistant_row_id.clone());
        let record = assistant_record(&state, final_id.clone());
        let provisional_id = assistant_row_id.clone();
        slot.set_cache_row(Some(final_id.clone()));
        self.ext.cache.write(&self.cache_key, &move |mut turns| {
            if let Some(row) = turns
                .iter_mut()
                .find(|row| row.id == final_id || row.id == provisional_id)
            {
                *row = record.clone();
            } else {
                turns.push(record.clone());
            }
            turns
        });
    }

    /// Retry turns mirror every update straight into the existing cache row
    /// so the conversation view reflects progress without subscribing.
    fn patch_retry_row(&self, slot: &SessionHandle) {
        let TurnMode::Retry { target_row_id } = &self.mode else {
            return;
        };
        let state = slot.snapshot();
        let mut record = assistant_record(&state, target_row_id.clone());
        record.pending = !state.ended;
        self.ext.cache.write(&self.cache_key, &move |mut turns| {
            if let Some(row) = turns.iter_mut().find(|row| row.id == record.id) {
                *row = record.clone();
            } else {
                turns.push(record.clone());
            }
            turns
        });
    }

    fn finish_terminal(&self, slot: &SessionHandle) {
        let state = slot.snapshot();
        match &self.mode {
            TurnMode::Primary {
                assistant_row_id, ..
            } => {
                // A failed turn in a saved conversation keeps its row, but
                // the row must stop claiming to be pending. (A failed
                // anonymous turn had its whole entry discarded instead.)
                if state.error.is_some() && !state.anonymous {
                    let row_id = assistant_row_id.clone();
                    let error = state.error.clone();
                    let text = state.effective_answer().to_string();
                    self.ext.cache.write(&self.cache_key, &move |mut turns| {
                        if let Some(row) = turns.iter_mut().find(|row| row.id == row_id) {
                            row.pending = false;
                            row.error = error.clone();
                            row.text = text.clone();
                        }
                        turns
                    });
                }
            }
            TurnMode::Retry { .. } => {
                // Retry sessions are single-use.
                self.registry.remove(&self.key);
            }
        }
    }
}

fn assistant_record(state: &SessionState, id: String) -> TurnRecord {
    let mut record = TurnRecord::assistant(id);
    record.text = state.effective_answer().to_string();
    record.reasoning = state.reasoning_text.clone();
    record.citations = state.citations.clone();
    record.citation_index_map = state.citation_index_map.clone();
    record.image_citations = state.image_citations.clone();
    record.research_steps = state.research_steps_ordered();
    record.pending = false;
    record.error = state.error.clone();
    record
}
