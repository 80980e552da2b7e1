use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use snapbooth_comfyui::api::{ComfyUIApiError, JobSubmitter, SubmitRequest};
use snapbooth_comfyui::client::ComfyUIClient;

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Accept a single WebSocket connection on an ephemeral port and hand it
/// to `script`. Returns a client pointed at the server.
pub async fn spawn_server<F, Fut>(script: F) -> (ComfyUIClient, JoinHandle<()>)
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        script(ws).await;
    });
    (
        ComfyUIClient::new(format!("ws://{addr}/ws"), format!("http://{addr}")),
        handle,
    )
}

pub async fn send_json(ws: &mut ServerSocket, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

pub async fn send_text(ws: &mut ServerSocket, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// A preview frame like the ones ComfyUI streams during sampling.
pub async fn send_binary(ws: &mut ServerSocket) {
    ws.send(Message::Binary(vec![1, 0, 0, 0, 0x89, b'P', b'N', b'G']))
        .await
        .unwrap();
}

pub async fn send_handshake(ws: &mut ServerSocket, sid: &str) {
    send_json(
        ws,
        serde_json::json!({"type": "status", "data": {"status": {}, "sid": sid}}),
    )
    .await;
}

/// Read until the client goes away.
pub async fn drain(ws: &mut ServerSocket) {
    while let Some(Ok(_)) = ws.next().await {}
}

/// Records submissions instead of sending them anywhere.
#[derive(Default)]
pub struct RecordingSubmitter {
    pub requests: Mutex<Vec<SubmitRequest>>,
    pub fail: bool,
}

#[async_trait]
impl JobSubmitter for RecordingSubmitter {
    async fn submit(&self, request: &SubmitRequest) -> Result<(), ComfyUIApiError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(ComfyUIApiError::ApiError {
                status: 500,
                body: "queue full".to_string(),
            });
        }
        Ok(())
    }
}

/// Accepts a submission and never answers.
pub struct StalledSubmitter;

#[async_trait]
impl JobSubmitter for StalledSubmitter {
    async fn submit(&self, _request: &SubmitRequest) -> Result<(), ComfyUIApiError> {
        std::future::pending().await
    }
}

/// How [`LoopbackSocket`] treats outgoing pings.
#[derive(Debug, Clone, Copy)]
pub enum PingFault {
    /// The write fails as if the peer vanished.
    Fail,
    /// The write is accepted but never flushed.
    Stall,
}

/// In-memory duplex socket. Reads yield a handshake and then nothing
/// until the write half is closed, at which point the read half ends.
pub struct LoopbackSocket {
    incoming: mpsc::UnboundedReceiver<Result<Message, WsError>>,
    loopback: Option<mpsc::UnboundedSender<Result<Message, WsError>>>,
    fault: PingFault,
    stalled: bool,
}

impl LoopbackSocket {
    pub fn new(fault: PingFault, sid: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let hello = serde_json::json!({"type": "status", "data": {"sid": sid}});
        tx.send(Ok(Message::Text(hello.to_string()))).unwrap();
        Self {
            incoming: rx,
            loopback: Some(tx),
            fault,
            stalled: false,
        }
    }
}

impl Stream for LoopbackSocket {
    type Item = Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.incoming.poll_recv(cx)
    }
}

impl Sink<Message> for LoopbackSocket {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
        match (item, self.fault) {
            (Message::Ping(_), PingFault::Fail) => Err(WsError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer went away",
            ))),
            (Message::Ping(_), PingFault::Stall) => {
                self.stalled = true;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        if self.stalled {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        self.stalled = false;
        self.loopback = None;
        Poll::Ready(Ok(()))
    }
}
