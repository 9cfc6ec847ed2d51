//! Connection factory for the server-push stream.
//!
//! The stream transport cannot carry request/response status codes for its
//! handshake, so a failed open is indistinguishable from an expired
//! credential. The factory compensates with a bounded protocol: one open
//! attempt under a timeout, a one-shot credential refresh, then a short
//! run of backoff retries. The state machine is explicit
//! (`Connecting -> Open`, `Connecting -> Refreshing -> Connecting`,
//! `Connecting -> Failed`) and each attempt owns its timer, so a resolved
//! attempt can never be raced by a stale one.

use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use async_trait::async_trait;
use futures::Stream;
use quill_protocol::StreamEvent;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;
use url::Url;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::error::Result;
use crate::external::CredentialStore;
use crate::util::backoff;

mod sse;

pub use sse::SseTransport;

/// One outbound turn request: the stream endpoint plus the serialized
/// request parameters. Message, tools, attachments, and model
/// configuration are serialized upstream by the message serializer.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: Url,
    pub params: Vec<(String, String)>,
}

impl StreamRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// The endpoint with all request parameters attached to the query.
    pub fn full_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &self.params {
                pairs.append_pair(name, value);
            }
        }
        url
    }
}

/// A live, opened push stream delivering decoded events in arrival order.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Result<StreamEvent>>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<Result<StreamEvent>>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Opens one push stream. Implementations resolve once the stream is live
/// (headers accepted, event pump running); everything after that arrives
/// through the returned [`EventStream`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        request: &StreamRequest,
        credentials: Option<String>,
    ) -> Result<EventStream>;
}

enum ConnectState {
    Connecting { refreshed: bool, attempt: u32 },
    Refreshing,
}

/// The connection factory: wraps a [`Transport`] in the timeout / refresh /
/// retry protocol and hands live streams to the turn controllers.
pub struct StreamClient {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    config: EngineConfig,
}

impl StreamClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            transport,
            credentials,
            config,
        }
    }

    /// Open a live stream for `request`, absorbing recoverable failures.
    /// Only exhaustion and refresh failure surface to the caller.
    pub async fn open_stream(&self, request: &StreamRequest) -> Result<EventStream> {
        let max_retries = self.config.max_retries_after_refresh;
        let mut state = ConnectState::Connecting {
            refreshed: false,
            attempt: 0,
        };
        let mut last_error = String::new();

        loop {
            state = match state {
                ConnectState::Connecting { refreshed, attempt } => {
                    // Fetch the latest credential each attempt; a refresh may
                    // have replaced it since the previous one.
                    let credentials = self.credentials.credentials();
                    let outcome = timeout(
                        self.config.open_timeout(),
                        self.transport.open(request, credentials),
                    )
                    .await;

                    match outcome {
                        Ok(Ok(stream)) => return Ok(stream),
                        Ok(Err(err)) => {
                            debug!(attempt, "stream open failed: {err}");
                            last_error = err.to_string();
                        }
                        Err(_elapsed) => {
                            debug!(attempt, "stream open timed out");
                            last_error = EngineError::ConnectTimeout.to_string();
                        }
                    }

                    if !refreshed {
                        ConnectState::Refreshing
                    } else if attempt >= max_retries {
                        return Err(EngineError::RetriesExhausted {
                            attempts: max_retries,
                            last: last_error,
                        });
                    } else {
                        tokio::time::sleep(backoff(self.config.initial_backoff(), attempt + 1))
                            .await;
                        ConnectState::Connecting {
                            refreshed: true,
                            attempt: attempt + 1,
                        }
                    }
                }
                ConnectState::Refreshing => {
                    if let Err(err) = self.credentials.refresh().await {
                        warn!("credential refresh failed: {err}");
                        return Err(EngineError::CredentialRefresh(err.to_string()));
                    }
                    tokio::time::sleep(self.config.refresh_pause()).await;
                    ConnectState::Connecting {
                        refreshed: true,
                        attempt: 0,
                    }
                }
            };
        }
    }
}
