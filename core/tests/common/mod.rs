#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use quill_core::Collaborators;
use quill_core::Engine;
use quill_core::EngineConfig;
use quill_core::EngineError;
use quill_core::EventStream;
use quill_core::StreamRequest;
use quill_core::Transport;
use quill_core::external::CredentialStore;
use quill_core::external::HistoryCache;
use quill_core::external::Navigator;
use quill_core::external::Notifier;
use quill_core::external::RevealQueue;
use quill_core::external::TitleSink;
use quill_core::external::TurnApi;
use quill_protocol::StreamEvent;
use quill_protocol::TurnList;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────
// History cache
// ────────────────────────────

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, TurnList>>,
}

impl MemoryCache {
    pub fn seed(&self, key: &str, turns: TurnList) {
        lock(&self.entries).insert(key.to_string(), turns);
    }
}

impl HistoryCache for MemoryCache {
    fn read(&self, key: &str) -> Option<TurnList> {
        lock(&self.entries).get(key).cloned()
    }

    fn write(&self, key: &str, patch: &dyn Fn(TurnList) -> TurnList) {
        let mut entries = lock(&self.entries);
        let current = entries.get(key).cloned().unwrap_or_default();
        entries.insert(key.to_string(), patch(current));
    }

    fn delete(&self, key: &str) {
        lock(&self.entries).remove(key);
    }
}

// ────────────────────────────
// Progressive reveal renderer
// ────────────────────────────

#[derive(Default)]
pub struct RecordingReveal {
    pub fragments: Mutex<Vec<(String, String)>>,
    pub flushes: Mutex<Vec<(String, String)>>,
    pub stops: Mutex<Vec<String>>,
}

impl RevealQueue for RecordingReveal {
    fn enqueue(&self, channel: &str, fragment: &str) {
        lock(&self.fragments).push((channel.to_string(), fragment.to_string()));
    }

    fn flush_immediately(&self, channel: &str, final_text: &str) {
        lock(&self.flushes).push((channel.to_string(), final_text.to_string()));
    }

    fn stop(&self, channel: &str) {
        lock(&self.stops).push(channel.to_string());
    }
}

impl RecordingReveal {
    pub fn fragment_texts(&self) -> Vec<String> {
        lock(&self.fragments)
            .iter()
            .map(|(_, fragment)| fragment.clone())
            .collect()
    }

    pub fn last_flush(&self) -> Option<String> {
        lock(&self.flushes).last().map(|(_, text)| text.clone())
    }
}

// ────────────────────────────
// Notifications, navigation, titles
// ────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify_error(&self, message: &str) {
        lock(&self.messages).push(message.to_string());
    }
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    pub destinations: Mutex<Vec<String>>,
}

impl Navigator for RecordingNavigator {
    fn navigate_to_conversation(&self, conversation_id: &str) {
        lock(&self.destinations).push(conversation_id.to_string());
    }
}

impl RecordingNavigator {
    pub fn destinations(&self) -> Vec<String> {
        lock(&self.destinations).clone()
    }
}

#[derive(Default)]
pub struct RecordingTitles {
    pub titles: Mutex<Vec<(String, String)>>,
}

impl TitleSink for RecordingTitles {
    fn title_updated(&self, key: &str, title: &str) {
        lock(&self.titles).push((key.to_string(), title.to_string()));
    }
}

// ────────────────────────────
// Turn API
// ────────────────────────────

#[derive(Default)]
pub struct StubApi {
    pub stops: Mutex<Vec<String>>,
    pub clarifications: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl TurnApi for StubApi {
    async fn stop_generation(&self, conversation_id: &str) -> Result<(), EngineError> {
        lock(&self.stops).push(conversation_id.to_string());
        Ok(())
    }

    async fn respond_clarification(
        &self,
        conversation_id: &str,
        clarification_id: &str,
        choice_id: &str,
    ) -> Result<(), EngineError> {
        lock(&self.clarifications).push((
            conversation_id.to_string(),
            clarification_id.to_string(),
            choice_id.to_string(),
        ));
        Ok(())
    }
}

impl StubApi {
    pub fn stops(&self) -> Vec<String> {
        lock(&self.stops).clone()
    }

    pub fn clarifications(&self) -> Vec<(String, String, String)> {
        lock(&self.clarifications).clone()
    }
}

// ────────────────────────────
// Credentials
// ────────────────────────────

#[derive(Default)]
pub struct StaticCredentials;

#[async_trait]
impl CredentialStore for StaticCredentials {
    fn credentials(&self) -> Option<String> {
        Some("Bearer fixture".to_string())
    }

    async fn refresh(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

// ────────────────────────────
// Scripted transport
// ────────────────────────────

pub enum OpenOutcome {
    Fail(&'static str),
    /// Deliver the events, then close the stream.
    Succeed(Vec<StreamEvent>),
    /// Deliver the events, then keep the stream open indefinitely.
    SucceedAndHold(Vec<StreamEvent>),
    /// Hand the test a stream it feeds by hand.
    Manual(mpsc::Receiver<Result<StreamEvent, EngineError>>),
}

pub struct ScriptedTransport {
    outcomes: Mutex<VecDeque<OpenOutcome>>,
}

impl ScriptedTransport {
    pub fn new(outcomes: Vec<OpenOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
        })
    }

    pub fn once(events: Vec<StreamEvent>) -> Arc<Self> {
        Self::new(vec![OpenOutcome::Succeed(events)])
    }

    /// A transport whose single stream is fed by the returned sender.
    pub fn manual() -> (Arc<Self>, mpsc::Sender<Result<StreamEvent, EngineError>>) {
        let (tx, rx) = mpsc::channel(64);
        (Self::new(vec![OpenOutcome::Manual(rx)]), tx)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &self,
        _request: &StreamRequest,
        _credentials: Option<String>,
    ) -> Result<EventStream, EngineError> {
        let outcome = lock(&self.outcomes).pop_front();
        match outcome {
            None => Err(EngineError::Transport("script exhausted".to_string())),
            Some(OpenOutcome::Fail(message)) => {
                Err(EngineError::Transport(message.to_string()))
            }
            Some(OpenOutcome::Succeed(events)) => {
                let (tx, rx) = mpsc::channel(64);
                tokio::spawn(async move {
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(EventStream::new(rx))
            }
            Some(OpenOutcome::SucceedAndHold(events)) => {
                let (tx, rx) = mpsc::channel(64);
                tokio::spawn(async move {
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    futures::future::pending::<()>().await;
                });
                Ok(EventStream::new(rx))
            }
            Some(OpenOutcome::Manual(rx)) => Ok(EventStream::new(rx)),
        }
    }
}

// ────────────────────────────
// Harness
// ────────────────────────────

pub struct Harness {
    pub engine: Arc<Engine>,
    pub cache: Arc<MemoryCache>,
    pub reveal: Arc<RecordingReveal>,
    pub notifier: Arc<RecordingNotifier>,
    pub navigator: Arc<RecordingNavigator>,
    pub titles: Arc<RecordingTitles>,
    pub api: Arc<StubApi>,
}

pub fn harness(transport: Arc<dyn Transport>) -> Harness {
    let cache = Arc::new(MemoryCache::default());
    let reveal = Arc::new(RecordingReveal::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let navigator = Arc::new(RecordingNavigator::default());
    let titles = Arc::new(RecordingTitles::default());
    let api = Arc::new(StubApi::default());

    let engine = Engine::new(
        EngineConfig::default(),
        transport,
        Collaborators {
            credentials: Arc::new(StaticCredentials),
            cache: Arc::clone(&cache) as Arc<dyn HistoryCache>,
            reveal: Arc::clone(&reveal) as Arc<dyn RevealQueue>,
            api: Arc::clone(&api) as Arc<dyn TurnApi>,
            notifier: Arc::clone(&notifier) as Arc<dyn Notifier>,
            navigator: Arc::clone(&navigator) as Arc<dyn Navigator>,
            titles: Arc::clone(&titles) as Arc<dyn TitleSink>,
        },
    );

    Harness {
        engine,
        cache,
        reveal,
        notifier,
        navigator,
        titles,
        api,
    }
}

/// Poll until `cond` holds; panics after five seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
