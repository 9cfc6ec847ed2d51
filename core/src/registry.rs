//! Process-wide map from session key to live session state.
//!
//! The registry is an explicit, constructible instance handed to the engine
//! at application-root scope; it is the only mutable resource shared across
//! observers. Identity rebinding is a transactional rename under a single
//! lock, so no reader can observe a map with zero or two entries for the
//! same session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::task::AbortHandle;

use crate::error::EngineError;
use crate::error::Result;
use crate::state::SessionState;

#[derive(Debug, Default)]
pub struct SessionSlot {
    state: Mutex<SessionState>,
    abort: Mutex<Option<AbortHandle>>,
    /// History-cache row this turn writes into, once known.
    cache_row: Mutex<Option<String>>,
}

pub type SessionHandle = Arc<SessionSlot>;

impl SessionSlot {
    fn new(state: SessionState) -> Self {
        Self {
            state: Mutex::new(state),
            abort: Mutex::new(None),
            cache_row: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `f` against the live state under the slot lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn set_abort(&self, handle: AbortHandle) {
        *self.abort.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn take_abort(&self) -> Option<AbortHandle> {
        self.abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn set_cache_row(&self, row_id: Option<String>) {
        *self
            .cache_row
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = row_id;
    }

    pub fn cache_row(&self) -> Option<String> {
        self.cache_row
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh session. Refuses while a session under the same key is
    /// still streaming (at most one active turn per conversation); a
    /// finished session under the key is replaced.
    pub fn create(&self, state: SessionState) -> Result<SessionHandle> {
        let key = state.session_key.clone();
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(&key)
            && existing.snapshot().is_streaming
        {
            return Err(EngineError::TurnInProgress(key));
        }
        let handle = Arc::new(SessionSlot::new(state));
        sessions.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn get(&self, key: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn snapshot(&self, key: &str) -> Option<SessionState> {
        self.get(key).map(|slot| slot.snapshot())
    }

    /// Transactional move of a session from `old` to `new`. The session's
    /// own `session_key` field is updated under the same lock.
    pub fn rename(&self, old: &str, new: &str) -> Result<SessionHandle> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let handle = sessions
            .remove(old)
            .ok_or_else(|| EngineError::UnknownSession(old.to_string()))?;
        handle.with_state(|state| state.session_key = new.to_string());
        sessions.insert(new.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    pub fn remove(&self, key: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn duplicate_create_refused_while_streaming() {
        let registry = SessionRegistry::new();
        registry
            .create(SessionState::new("c-1", false))
            .expect("first create");
        let err = registry
            .create(SessionState::new("c-1", false))
            .expect_err("second create must fail");
        assert!(matches!(err, EngineError::TurnInProgress(_)));
    }

    #[test]
    fn finished_session_is_replaced() {
        let registry = SessionRegistry::new();
        let slot = registry
            .create(SessionState::new("c-1", false))
            .expect("create");
        slot.with_state(|state| {
            state.is_streaming = false;
            state.ended = true;
        });
        registry
            .create(SessionState::new("c-1", false))
            .expect("replacing a finished session is allowed");
    }

    #[test]
    fn rename_moves_the_session_atomically() {
        let registry = SessionRegistry::new();
        let slot = registry
            .create(SessionState::new_anonymous("anon-1"))
            .expect("create");
        slot.with_state(|state| state.answer_text = "partial".to_string());

        registry.rename("anon-1", "c-9").expect("rename");

        assert!(registry.snapshot("anon-1").is_none());
        let moved = registry.snapshot("c-9").expect("session under new key");
        assert_eq!(moved.session_key, "c-9");
        assert_eq!(moved.answer_text, "partial");
    }

    #[test]
    fn rename_of_unknown_key_fails() {
        let registry = SessionRegistry::new();
        let err = registry.rename("missing", "c-9").expect_err("must fail");
        assert!(matches!(err, EngineError::UnknownSession(_)));
    }
}
