//! End-to-end execution of one generation job.
//!
//! ```text
//! style -> template -> stage input -> snapshot output dir -> build job
//!       -> connect -> submit -> listen -> close -> await artifact
//!       -> decode header -> archive
//! ```
//!
//! [`JobRunner::run`] never fails: any error yields the source image back
//! as [`GenerationOutcome::Fallback`] so the caller always has something
//! to show. Cancellation yields [`GenerationOutcome::Cancelled`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use snapbooth_comfyui::api::{ComfyUIApi, JobSubmitter};
use snapbooth_comfyui::channel::{ChannelConfig, ChannelError, JobChannel};
use snapbooth_comfyui::client::ComfyUIClient;
use snapbooth_core::artifact::{decode_dimensions, ArtifactError, ArtifactLocator, LocatedArtifact};
use snapbooth_core::builder::{build, JobParameters, SeedPolicy};
use snapbooth_core::error::CoreError;
use snapbooth_core::progress::ProgressState;
use snapbooth_core::template::{JobTemplate, ProfileStore, StyleCatalog};
use snapbooth_core::types::Percent;

use crate::config::BoothConfig;

/// Filename prefix handed to the save-image node.
pub const OUTPUT_TAG: &str = "output";

const ARCHIVE_PREFIX: &str = "photobooth_";
const ARCHIVE_OUTPUT: &str = "output.png";
const ARCHIVE_INPUT: &str = "input.png";

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// Encoded bytes of the captured photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    bytes: Arc<Vec<u8>>,
}

impl SourceImage {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    pub fn read(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_bytes(std::fs::read(path)?))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// What to generate.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub style: String,
    pub source: SourceImage,
}

/// A validated result read from the output directory.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Archive folder, when the result was kept.
    pub archived: Option<PathBuf>,
}

/// How a job ended.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Generated(GeneratedImage),
    /// The job failed; `image` is the unchanged source.
    Fallback { image: SourceImage, reason: String },
    /// Cancelled locally. The remote job may still run to completion.
    Cancelled,
}

impl GenerationOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The image to display, if any.
    pub fn image_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Generated(image) => Some(&image.bytes),
            Self::Fallback { image, .. } => Some(image.bytes()),
            Self::Cancelled => None,
        }
    }
}

/// Everything that can turn a job into a fallback.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Channel(ChannelError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("Failed to stage input image at {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cancelled")]
    Cancelled,
}

impl From<ChannelError> for GenerationError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Cancelled => Self::Cancelled,
            other => Self::Channel(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ArchivePolicy {
    saved_dir: Option<PathBuf>,
    keep_generated: bool,
    keep_input: bool,
}

/// Runs generation jobs against one ComfyUI instance. Holds no per-job
/// state, so one runner can serve any number of sequential jobs.
pub struct JobRunner {
    client: ComfyUIClient,
    submitter: Arc<dyn JobSubmitter>,
    profiles: ProfileStore,
    catalog: StyleCatalog,
    locator: ArtifactLocator,
    channel: ChannelConfig,
    input_image: PathBuf,
    artifact_timeout: Duration,
    artifact_poll: Duration,
    archive: ArchivePolicy,
    seed: SeedPolicy,
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("input_image", &self.input_image)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
    /// Runner submitting over HTTP to `config.api_url`.
    pub fn from_config(config: &BoothConfig) -> Result<Self, CoreError> {
        let api = ComfyUIApi::new(config.api_url.clone()).with_timeout(config.submit_timeout);
        Self::with_submitter(config, Arc::new(api))
    }

    /// Runner with a custom submission path. Loads the style catalog.
    pub fn with_submitter(
        config: &BoothConfig,
        submitter: Arc<dyn JobSubmitter>,
    ) -> Result<Self, CoreError> {
        let catalog = StyleCatalog::load(&config.styles_file)?;
        tracing::info!(
            styles = catalog.names().count(),
            workflow_dir = %config.workflow_dir.display(),
            "Job runner ready"
        );

        Ok(Self {
            client: ComfyUIClient::new(config.ws_url.clone(), config.api_url.clone()),
            submitter,
            profiles: ProfileStore::new(config.workflow_dir.clone()),
            catalog,
            locator: ArtifactLocator::new(config.output_dir.clone()),
            channel: config.channel_config(),
            input_image: config.input_image.clone(),
            artifact_timeout: config.artifact_timeout,
            artifact_poll: config.artifact_poll,
            archive: ArchivePolicy {
                saved_dir: config.saved_dir.clone(),
                keep_generated: config.keep_generated,
                keep_input: config.keep_input,
            },
            seed: SeedPolicy::Random,
        })
    }

    pub fn with_seed(mut self, seed: SeedPolicy) -> Self {
        self.seed = seed;
        self
    }

    pub fn catalog(&self) -> &StyleCatalog {
        &self.catalog
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    /// Run one job to an outcome. Progress is reported in event order.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        on_progress: &mut (dyn FnMut(Percent) + Send),
        cancel: &CancellationToken,
    ) -> GenerationOutcome {
        match self.try_run(request, on_progress, cancel).await {
            Ok(image) => {
                tracing::info!(
                    style = %request.style,
                    path = %image.path.display(),
                    width = image.width,
                    height = image.height,
                    "Generation succeeded"
                );
                GenerationOutcome::Generated(image)
            }
            Err(GenerationError::Cancelled) => {
                tracing::info!(style = %request.style, "Generation cancelled");
                GenerationOutcome::Cancelled
            }
            Err(e) => {
                tracing::warn!(style = %request.style, error = %e, "Generation failed, falling back to source image");
                GenerationOutcome::Fallback {
                    image: request.source.clone(),
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_run(
        &self,
        request: &GenerationRequest,
        on_progress: &mut (dyn FnMut(Percent) + Send),
        cancel: &CancellationToken,
    ) -> Result<GeneratedImage, GenerationError> {
        let style = self.catalog.get_or_default(&request.style);
        let template = self.profiles.load(&style.name)?;

        self.stage_input(&request.source)?;
        let result = self
            .generate(request, &style.prompt, &template, on_progress, cancel)
            .await;
        self.release_input();
        result
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        prompt: &str,
        template: &JobTemplate,
        on_progress: &mut (dyn FnMut(Percent) + Send),
        cancel: &CancellationToken,
    ) -> Result<GeneratedImage, GenerationError> {
        let before = self.locator.snapshot()?;

        let job = build(
            template,
            &JobParameters {
                prompt_text: prompt.to_string(),
                seed: self.seed,
                source_image_ref: self.input_image.display().to_string(),
                output_tag: OUTPUT_TAG.to_string(),
            },
        );
        let mut progress = ProgressState::init(&job);
        tracing::debug!(budget = progress.budget_sum(), "Job built");

        let mut channel = JobChannel::connect(&self.client, self.channel.clone(), cancel).await?;
        let listened = async {
            channel.submit(self.submitter.as_ref(), &job, cancel).await?;
            channel.listen(&mut progress, &mut *on_progress, cancel).await
        }
        .await;
        channel.close().await;
        listened?;

        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        let artifact = tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            located = self.locator.await_artifact(&before, self.artifact_timeout, self.artifact_poll) => located?,
        };
        let (width, height) = decode_dimensions(&artifact.path, &artifact.bytes)?;
        let archived = self.archive(&artifact, &request.source);

        Ok(GeneratedImage {
            path: artifact.path,
            bytes: artifact.bytes,
            width,
            height,
            archived,
        })
    }

    fn stage_input(&self, source: &SourceImage) -> Result<(), GenerationError> {
        let stage_err = |source| GenerationError::Stage {
            path: self.input_image.clone(),
            source,
        };
        if let Some(parent) = self.input_image.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(stage_err)?;
        }
        std::fs::write(&self.input_image, source.bytes()).map_err(stage_err)?;
        tracing::debug!(path = %self.input_image.display(), "Input image staged");
        Ok(())
    }

    fn release_input(&self) {
        if self.archive.keep_input {
            return;
        }
        match std::fs::remove_file(&self.input_image) {
            Ok(()) => tracing::debug!(path = %self.input_image.display(), "Staged input removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.input_image.display(), error = %e, "Failed to remove staged input")
            }
        }
    }

    /// Copy the result into a timestamped folder. Failures are logged and
    /// do not affect the outcome.
    fn archive(&self, artifact: &LocatedArtifact, source: &SourceImage) -> Option<PathBuf> {
        if !self.archive.keep_generated {
            return None;
        }
        let saved_dir = self.archive.saved_dir.as_ref()?;

        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        let folder = saved_dir.join(format!("{ARCHIVE_PREFIX}{stamp}"));
        let written = std::fs::create_dir_all(&folder)
            .and_then(|()| std::fs::write(folder.join(ARCHIVE_OUTPUT), &artifact.bytes))
            .and_then(|()| {
                if self.archive.keep_input {
                    std::fs::write(folder.join(ARCHIVE_INPUT), source.bytes())
                } else {
                    Ok(())
                }
            });

        match written {
            Ok(()) => {
                tracing::info!(path = %folder.display(), "Result archived");
                Some(folder)
            }
            Err(e) => {
                tracing::warn!(path = %folder.display(), error = %e, "Failed to archive result");
                None
            }
        }
    }
}
