#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use snapbooth_comfyui::api::{ComfyUIApiError, JobSubmitter, SubmitRequest};
use snapbooth_pipeline::config::BoothConfig;

pub type ServerSocket = WebSocketStream<TcpStream>;

/// 1x1 RGBA PNG.
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// Stand-in for the captured photo.
pub const SOURCE_BYTES: &[u8] = b"captured photo";

const SKETCH_PROFILE: &str = r#"{
    "3": {"class_type": "KSampler", "inputs": {"steps": 20, "seed": 0, "preview_method": "none"}},
    "6": {"class_type": "Text Multiline", "inputs": {"text": ""}},
    "10": {"class_type": "LoadImage", "inputs": {"image": ""}},
    "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "ComfyUI"}}
}"#;

const DEFAULT_PROFILE: &str = r#"{
    "3": {"class_type": "KSampler", "inputs": {"steps": 10, "seed": 0}},
    "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "ComfyUI"}}
}"#;

const STYLES: &str = r#"[
    {"name": "sketch", "prompt": "pencil sketch portrait"},
    {"name": "comic", "prompt": "comic book portrait"}
]"#;

/// A booth laid out in a temp dir, pointed at a fake ComfyUI.
pub struct Booth {
    pub dir: TempDir,
    pub config: BoothConfig,
}

impl Booth {
    pub fn new(ws_url: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workflows = dir.path().join("workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(workflows.join("sketch.json"), SKETCH_PROFILE).unwrap();
        std::fs::write(workflows.join("default.json"), DEFAULT_PROFILE).unwrap();
        std::fs::write(workflows.join("styles.json"), STYLES).unwrap();
        std::fs::create_dir_all(dir.path().join("output")).unwrap();

        let config = BoothConfig {
            ws_url: ws_url.to_string(),
            api_url: "http://127.0.0.1:9".to_string(),
            workflow_dir: workflows.clone(),
            styles_file: workflows.join("styles.json"),
            output_dir: dir.path().join("output"),
            input_image: dir.path().join("input").join("input.png"),
            handshake_timeout: Duration::from_secs(2),
            receive_poll: Duration::from_millis(50),
            artifact_timeout: Duration::from_secs(2),
            artifact_poll: Duration::from_millis(20),
            ..BoothConfig::default()
        };
        Self { dir, config }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.config.output_dir.clone()
    }
}

/// Accept WebSocket connections and run `script` on the first one.
pub async fn spawn_server<F, Fut>(script: F) -> (String, JoinHandle<()>)
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
    (format!("ws://{addr}/ws"), handle)
}

pub async fn send_json(ws: &mut ServerSocket, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

pub async fn send_handshake(ws: &mut ServerSocket) {
    send_json(ws, serde_json::json!({"type": "status", "data": {"sid": "booth-sid"}})).await;
}

pub async fn drain(ws: &mut ServerSocket) {
    while let Some(Ok(_)) = ws.next().await {}
}

/// Plays ComfyUI's side of a submission: records it and, when given an
/// artifact, writes it into the output directory.
pub struct FakeComfy {
    pub output_dir: PathBuf,
    pub artifact: Option<&'static [u8]>,
    pub submissions: AtomicUsize,
    pub last: std::sync::Mutex<Option<SubmitRequest>>,
}

impl FakeComfy {
    pub fn writing(output_dir: PathBuf, artifact: &'static [u8]) -> Arc<Self> {
        Arc::new(Self {
            output_dir,
            artifact: Some(artifact),
            submissions: AtomicUsize::new(0),
            last: std::sync::Mutex::new(None),
        })
    }

    pub fn silent(output_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            output_dir,
            artifact: None,
            submissions: AtomicUsize::new(0),
            last: std::sync::Mutex::new(None),
        })
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobSubmitter for FakeComfy {
    async fn submit(&self, request: &SubmitRequest) -> Result<(), ComfyUIApiError> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(request.clone());
        if let Some(bytes) = self.artifact {
            let name = format!("output_{:05}_.png", n + 1);
            std::fs::write(self.output_dir.join(name), bytes).unwrap();
        }
        Ok(())
    }
}

/// Accepts a submission and never answers, like a wedged HTTP endpoint.
#[derive(Default)]
pub struct StalledComfy {
    pub entered: tokio::sync::Notify,
}

#[async_trait]
impl JobSubmitter for StalledComfy {
    async fn submit(&self, _request: &SubmitRequest) -> Result<(), ComfyUIApiError> {
        self.entered.notify_one();
        std::future::pending().await
    }
}
