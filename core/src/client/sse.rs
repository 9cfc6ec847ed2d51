use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use quill_protocol::StreamEvent;
use quill_protocol::WireEvent;
use quill_protocol::decode;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use crate::client::EventStream;
use crate::client::StreamRequest;
use crate::client::Transport;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::error::Result;

/// The production transport: one HTTP request per turn held open as a
/// server-sent-event stream. Named events are decoded as they arrive and
/// pumped into a bounded channel; the pump task owns the idle watchdog.
pub struct SseTransport {
    client: reqwest::Client,
    idle_timeout: Duration,
    channel_capacity: usize,
}

impl SseTransport {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(EngineError::Http)?;
        Ok(Self {
            client,
            idle_timeout: config.stream_idle_timeout(),
            channel_capacity: config.event_channel_capacity,
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn open(
        &self,
        request: &StreamRequest,
        credentials: Option<String>,
    ) -> Result<EventStream> {
        let mut builder = self
            .client
            .get(request.full_url())
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(credentials) = credentials {
            builder = builder.header(reqwest::header::AUTHORIZATION, credentials);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Transport(format!(
                "stream open rejected with status {status}"
            )));
        }

        let (tx, rx) = mpsc::channel::<Result<StreamEvent>>(self.channel_capacity);
        tokio::spawn(process_sse(
            response.bytes_stream(),
            tx,
            self.idle_timeout,
        ));
        Ok(EventStream::new(rx))
    }
}

/// Pump raw SSE frames into decoded events until the stream ends. The
/// stream stays open across clarification pauses; only `end`, a server
/// `error`, transport failure, idle timeout, or receiver drop stop the pump.
pub(crate) async fn process_sse<S, E>(
    stream: S,
    tx: mpsc::Sender<Result<StreamEvent>>,
    idle_timeout: Duration,
) where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error,
{
    let mut stream = stream.eventsource();
    let mut saw_end = false;

    loop {
        let next = timeout(idle_timeout, stream.next()).await;
        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                debug!("stream transport error: {err}");
                let _ = tx
                    .send(Err(EngineError::Transport(format!("[transport] {err}"))))
                    .await;
                return;
            }
            Ok(None) => {
                if !saw_end {
                    let _ = tx
                        .send(Err(EngineError::Transport(
                            "stream closed before end".to_string(),
                        )))
                        .await;
                }
                return;
            }
            Err(_elapsed) => {
                let _ = tx
                    .send(Err(EngineError::Transport(
                        "[idle] timeout waiting for stream event".to_string(),
                    )))
                    .await;
                return;
            }
        };

        trace!(event = %frame.event, len = frame.data.len(), "stream frame");
        let event = decode(WireEvent::new(frame.event, frame.data));
        let terminal = matches!(event, StreamEvent::End | StreamEvent::Error(_));
        if matches!(event, StreamEvent::End) {
            saw_end = true;
        }
        if tx.send(Ok(event)).await.is_err() {
            // Receiver dropped: the session was stopped locally.
            return;
        }
        if terminal {
            return;
        }
    }
}
