//! Per-job event channel to a ComfyUI instance.
//!
//! A [`JobChannel`] owns one WebSocket for the lifetime of one job:
//!
//! ```text
//! Connecting -> Ready -> Submitting -> Listening -> Completed | Failed | Cancelled
//! ```
//!
//! The job itself is submitted over HTTP, tagged with the session id the
//! server announced during the handshake. Results only ever arrive as
//! events on the WebSocket. A heartbeat task pings the server while the
//! channel is open, and the connection is closed exactly once however
//! listening ends.
//!
//! Cancellation is local: the remote job keeps running, we just stop
//! waiting for it.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use snapbooth_core::builder::SubmittedJob;
use snapbooth_core::progress::ProgressState;
use snapbooth_core::types::Percent;

use crate::api::{ComfyUIApiError, JobSubmitter, SubmitRequest};
use crate::client::{ComfyUIClient, ComfyUIClientError, WsStream};
use crate::messages::{classify, parse_message, ChannelEvent, CompletionEvents};

/// Bounded wait for the server's first message.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between liveness pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Upper bound on a single receive wait while listening.
pub const DEFAULT_RECEIVE_POLL: Duration = Duration::from_secs(1);

/// Percentage reported when the remote job fails.
const FAILED_PROGRESS: Percent = 100.0;

/// Tunables for a [`JobChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub receive_poll: Duration,
    pub completion_events: CompletionEvents,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            receive_poll: DEFAULT_RECEIVE_POLL,
            completion_events: CompletionEvents::default(),
        }
    }
}

/// Lifecycle of a [`JobChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Ready,
    Submitting,
    Listening,
    Completed,
    Failed,
    Cancelled,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Errors that end a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Connect(#[from] ComfyUIClientError),

    #[error("No handshake from ComfyUI within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Submission failed: {0}")]
    Submit(#[from] ComfyUIApiError),

    #[error("Remote execution failed: {0}")]
    ExecutionFailed(String),

    /// Local cancellation. Not a failure of the job.
    #[error("Cancelled")]
    Cancelled,

    #[error("Channel is {actual:?}, expected {expected:?}")]
    InvalidState {
        actual: ChannelState,
        expected: ChannelState,
    },
}

/// The open connection and what we know about it.
pub struct ChannelSession<S> {
    sink: Arc<Mutex<SplitSink<S, Message>>>,
    stream: SplitStream<S>,
    session_id: String,
    last_event_at: Instant,
    closed: bool,
}

/// Periodic ping task sharing the write half of the connection.
struct Heartbeat {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    lost: Arc<std::sync::Mutex<Option<String>>>,
}

impl Heartbeat {
    fn spawn<S>(sink: Arc<Mutex<SplitSink<S, Message>>>, interval: Duration) -> Self
    where
        S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let lost = Arc::new(std::sync::Mutex::new(None));

        let task_cancel = cancel.clone();
        let task_lost = Arc::clone(&lost);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut sink = sink.lock().await;
                        // A stalled write must not outlive the next tick.
                        let failure = match tokio::time::timeout(interval, sink.send(Message::Ping(Vec::new()))).await {
                            Ok(Ok(())) => None,
                            Ok(Err(e)) => Some(e.to_string()),
                            Err(_) => Some(format!("ping not sent within {interval:?}")),
                        };
                        match failure {
                            None => tracing::trace!("Heartbeat ping sent"),
                            Some(reason) => {
                                tracing::warn!(error = %reason, "Heartbeat ping failed, closing channel");
                                if let Ok(mut slot) = task_lost.lock() {
                                    *slot = Some(reason);
                                }
                                let _ = tokio::time::timeout(interval, sink.close()).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            cancel,
            handle,
            lost,
        }
    }

    fn lost_reason(&self) -> Option<String> {
        self.lost.lock().ok().and_then(|slot| slot.clone())
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Heartbeat task ended abnormally");
        }
    }
}

/// One job's duplex channel to ComfyUI. Never reused across jobs.
pub struct JobChannel<S> {
    session: ChannelSession<S>,
    state: ChannelState,
    config: ChannelConfig,
    heartbeat: Option<Heartbeat>,
}

impl<S> std::fmt::Debug for JobChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobChannel")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobChannel<WsStream> {
    /// Open a WebSocket to `client` and complete the handshake.
    ///
    /// Connecting and the handshake share one bounded wait.
    pub async fn connect(
        client: &ComfyUIClient,
        config: ChannelConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, ChannelError> {
        let started = Instant::now();
        let connection = tokio::select! {
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
            result = tokio::time::timeout(config.handshake_timeout, client.connect()) => {
                result.map_err(|_| ChannelError::HandshakeTimeout(config.handshake_timeout))??
            }
        };

        let config = ChannelConfig {
            handshake_timeout: config.handshake_timeout.saturating_sub(started.elapsed()),
            ..config
        };
        Self::handshake(connection.ws_stream, config, cancel).await
    }
}

impl<S> JobChannel<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    /// Wait for the first message carrying a session id, then start the
    /// heartbeat. Non-text frames and messages without an id are skipped.
    pub async fn handshake(
        stream: S,
        config: ChannelConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, ChannelError> {
        let (sink, mut stream) = stream.split();
        let sink = Arc::new(Mutex::new(sink));

        let handshake = {
            let wait = wait_for_session_id(&mut stream);
            tokio::select! {
                _ = cancel.cancelled() => Err(ChannelError::Cancelled),
                result = tokio::time::timeout(config.handshake_timeout, wait) => {
                    result.unwrap_or(Err(ChannelError::HandshakeTimeout(config.handshake_timeout)))
                }
            }
        };

        let session_id = match handshake {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "ComfyUI handshake failed");
                let _ = sink.lock().await.close().await;
                return Err(e);
            }
        };

        tracing::info!(session_id = %session_id, "ComfyUI handshake complete");

        let heartbeat = Heartbeat::spawn(Arc::clone(&sink), config.heartbeat_interval);
        Ok(Self {
            session: ChannelSession {
                sink,
                stream,
                session_id,
                last_event_at: Instant::now(),
                closed: false,
            },
            state: ChannelState::Ready,
            config,
            heartbeat: Some(heartbeat),
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.session.closed
    }

    /// Submit `job` tagged with this channel's session id.
    ///
    /// The HTTP response only confirms queuing; the result is awaited
    /// with [`listen`](Self::listen).
    pub async fn submit(
        &mut self,
        submitter: &dyn JobSubmitter,
        job: &SubmittedJob,
        cancel: &CancellationToken,
    ) -> Result<(), ChannelError> {
        self.expect_state(ChannelState::Ready)?;
        if cancel.is_cancelled() {
            self.state = ChannelState::Cancelled;
            return Err(ChannelError::Cancelled);
        }

        self.state = ChannelState::Submitting;
        let request = SubmitRequest::for_job(&self.session.session_id, job);
        let submitted = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(session_id = %self.session.session_id, "Submission abandoned");
                self.state = ChannelState::Cancelled;
                return Err(ChannelError::Cancelled);
            }
            result = submitter.submit(&request) => result,
        };
        match submitted {
            Ok(()) => {
                self.state = ChannelState::Listening;
                Ok(())
            }
            Err(e) => {
                tracing::error!(session_id = %self.session.session_id, error = %e, "Job submission failed");
                self.state = ChannelState::Failed;
                Err(e.into())
            }
        }
    }

    /// Consume events until a terminal one arrives, then close.
    ///
    /// Progress events update `progress` and are reported through
    /// `on_progress` in arrival order. `Ok(())` means the job completed.
    pub async fn listen(
        &mut self,
        progress: &mut ProgressState,
        on_progress: &mut (dyn FnMut(Percent) + Send),
        cancel: &CancellationToken,
    ) -> Result<(), ChannelError> {
        self.expect_state(ChannelState::Listening)?;

        let result = self.receive_loop(progress, on_progress, cancel).await;
        self.state = match &result {
            Ok(()) => ChannelState::Completed,
            Err(ChannelError::Cancelled) => ChannelState::Cancelled,
            Err(_) => ChannelState::Failed,
        };
        tracing::info!(session_id = %self.session.session_id, state = ?self.state, "Stopped listening");

        self.close().await;
        result
    }

    /// Stop the heartbeat and close the connection. Idempotent.
    pub async fn close(&mut self) {
        if self.session.closed {
            return;
        }
        self.session.closed = true;

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        if let Err(e) = self.session.sink.lock().await.close().await {
            tracing::debug!(error = %e, "Error while closing ComfyUI WebSocket");
        }
        tracing::debug!(session_id = %self.session.session_id, "ComfyUI channel closed");
    }

    async fn receive_loop(
        &mut self,
        progress: &mut ProgressState,
        on_progress: &mut (dyn FnMut(Percent) + Send),
        cancel: &CancellationToken,
    ) -> Result<(), ChannelError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ChannelError::Cancelled);
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
                next = tokio::time::timeout(self.config.receive_poll, self.session.stream.next()) => next,
            };

            let msg = match next {
                Err(_elapsed) => {
                    tracing::trace!(
                        idle_ms = self.session.last_event_at.elapsed().as_millis() as u64,
                        "Waiting for ComfyUI events"
                    );
                    continue;
                }
                Ok(None) => return Err(self.connection_lost("stream ended".to_string())),
                Ok(Some(Err(e))) => return Err(self.connection_lost(e.to_string())),
                Ok(Some(Ok(msg))) => msg,
            };
            self.session.last_event_at = Instant::now();

            match msg {
                Message::Text(text) => {
                    if let Some(terminal) = self.handle_text(&text, progress, on_progress) {
                        return terminal;
                    }
                }
                Message::Binary(_) => {
                    // Preview images.
                    tracing::trace!("Ignoring binary message");
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Close(frame) => {
                    return Err(self.connection_lost(format!("closed by server: {frame:?}")));
                }
            }
        }
    }

    /// Returns `Some` when the message ends listening.
    fn handle_text(
        &self,
        text: &str,
        progress: &mut ProgressState,
        on_progress: &mut (dyn FnMut(Percent) + Send),
    ) -> Option<Result<(), ChannelError>> {
        let event = match parse_message(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, raw_len = text.len(), "Ignoring undecodable ComfyUI message");
                return None;
            }
        };

        match classify(&event, &self.config.completion_events) {
            ChannelEvent::Progress {
                node: Some(node),
                value,
            } if progress.is_tracked(&node) => {
                let percent = progress.update(&node, value);
                tracing::debug!(node = %node, value, percent, "Generation progress");
                on_progress(percent);
                None
            }
            ChannelEvent::Progress { node, .. } => {
                tracing::debug!(node = ?node, "Ignoring progress for unknown node");
                None
            }
            ChannelEvent::Completed { kind } => {
                tracing::info!(session_id = %self.session.session_id, kind = %kind, "Generation finished");
                Some(Ok(()))
            }
            ChannelEvent::ExecutionError { message } => {
                on_progress(FAILED_PROGRESS);
                let message = message.unwrap_or_else(|| "unspecified execution error".to_string());
                tracing::error!(session_id = %self.session.session_id, error = %message, "Execution error");
                Some(Err(ChannelError::ExecutionFailed(message)))
            }
            ChannelEvent::Other { kind } => {
                tracing::trace!(kind = %kind, "Ignoring ComfyUI message");
                None
            }
        }
    }

    /// Prefer the heartbeat's failure reason when it saw the drop first.
    fn connection_lost(&self, reason: String) -> ChannelError {
        let reason = self
            .heartbeat
            .as_ref()
            .and_then(Heartbeat::lost_reason)
            .map(|hb| format!("heartbeat failed: {hb}"))
            .unwrap_or(reason);
        tracing::warn!(session_id = %self.session.session_id, reason = %reason, "ComfyUI connection lost");
        ChannelError::ConnectionLost(reason)
    }

    fn expect_state(&self, expected: ChannelState) -> Result<(), ChannelError> {
        if self.state != expected {
            return Err(ChannelError::InvalidState {
                actual: self.state,
                expected,
            });
        }
        Ok(())
    }
}

impl<S> Drop for JobChannel<S> {
    fn drop(&mut self) {
        // An unclosed channel still has a heartbeat holding the sink.
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.cancel.cancel();
        }
    }
}

async fn wait_for_session_id<S>(stream: &mut SplitStream<S>) -> Result<String, ChannelError>
where
    S: Stream<Item = Result<Message, WsError>>,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match parse_message(&text) {
                Ok(event) => match event.session_id() {
                    Some(id) => return Ok(id.to_string()),
                    None => tracing::debug!(kind = %event.kind, "Handshake message without session id"),
                },
                Err(e) => tracing::debug!(error = %e, "Ignoring undecodable handshake message"),
            },
            Ok(Message::Close(frame)) => {
                return Err(ChannelError::ConnectionLost(format!(
                    "closed during handshake: {frame:?}"
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(ChannelError::ConnectionLost(e.to_string())),
        }
    }
    Err(ChannelError::ConnectionLost(
        "stream ended during handshake".to_string(),
    ))
}
