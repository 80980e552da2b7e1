//! A minimal booth sequencer driving one shot at a time:
//!
//! ```text
//! Idle -> Countdown -> Capture -> Generation -> Validation -> Idle
//! ```
//!
//! Session callbacks fire on background threads; they are forwarded into
//! a per-shot channel and handled here in order.

use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use snapbooth_core::error::CoreError;
use snapbooth_core::types::Percent;
use snapbooth_pipeline::runner::{GenerationOutcome, SourceImage};
use snapbooth_pipeline::session::BoothSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Countdown,
    Capture,
    Generation,
    Validation,
}

#[derive(Debug)]
enum BoothEvent {
    Tick(u32),
    CountdownFinished,
    Progress(Percent),
    GenerationFinished(GenerationOutcome),
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Style(#[from] CoreError),

    #[error("Failed to read captured image {path}: {source}")]
    Capture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write result {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Booth is busy")]
    Busy,

    #[error("Shot cancelled")]
    Cancelled,

    #[error("Session stopped reporting")]
    Disconnected,
}

/// What a finished shot produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shot {
    /// The image to show: the written result, or the capture itself.
    pub path: PathBuf,
    pub generated: bool,
}

pub struct Sequencer {
    session: BoothSession,
    phase: Phase,
}

impl Sequencer {
    pub fn new(session: BoothSession) -> Self {
        Self {
            session,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> &BoothSession {
        &self.session
    }

    /// Count down, capture `capture`, generate and write the result next
    /// to it. Resolving `shutdown` aborts the shot.
    pub async fn take_shot<S>(
        &mut self,
        capture: &Path,
        style: Option<&str>,
        shutdown: S,
    ) -> Result<Shot, HostError>
    where
        S: Future<Output = ()>,
    {
        if self.phase != Phase::Idle {
            return Err(HostError::Busy);
        }
        if let Some(style) = style {
            self.session.select_style(style)?;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.enter(Phase::Countdown);
        let tick_tx = tx.clone();
        let done_tx = tx.clone();
        let started = self.session.start_countdown(
            self.session.countdown_start(),
            move |n| {
                let _ = tick_tx.send(BoothEvent::Tick(n));
            },
            move || {
                let _ = done_tx.send(BoothEvent::CountdownFinished);
            },
        );
        if !started {
            self.enter(Phase::Idle);
            return Err(HostError::Busy);
        }

        tokio::pin!(shutdown);
        let mut tx = Some(tx);
        let result = loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => break Err(HostError::Cancelled),
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break Err(HostError::Disconnected),
                },
            };

            match event {
                BoothEvent::Tick(remaining) => tracing::info!(remaining, "Countdown"),
                BoothEvent::CountdownFinished => {
                    if let Err(e) = self.capture_and_generate(capture, tx.take()) {
                        break Err(e);
                    }
                }
                BoothEvent::Progress(percent) => tracing::info!(percent, "Generating"),
                BoothEvent::GenerationFinished(outcome) => {
                    self.enter(Phase::Validation);
                    break validate(capture, outcome);
                }
            }
        };

        if result.is_err() {
            self.session.stop_countdown();
            self.session.cancel_generation();
        }
        self.enter(Phase::Idle);
        result
    }

    fn capture_and_generate(
        &mut self,
        capture: &Path,
        tx: Option<mpsc::UnboundedSender<BoothEvent>>,
    ) -> Result<(), HostError> {
        let tx = tx.ok_or(HostError::Busy)?;

        self.enter(Phase::Capture);
        let source = SourceImage::read(capture).map_err(|source| HostError::Capture {
            path: capture.to_path_buf(),
            source,
        })?;

        self.enter(Phase::Generation);
        let progress_tx = tx.clone();
        let started = self.session.start_selected_generation(
            source,
            move |percent| {
                let _ = progress_tx.send(BoothEvent::Progress(percent));
            },
            move |outcome| {
                let _ = tx.send(BoothEvent::GenerationFinished(outcome));
            },
        );
        if !started {
            return Err(HostError::Busy);
        }
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "Phase change");
            self.phase = phase;
        }
    }
}

/// Where a generated result for `capture` is written.
pub fn result_path(capture: &Path) -> PathBuf {
    let stem = capture
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture".to_string());
    capture.with_file_name(format!("{stem}_generated.png"))
}

fn validate(capture: &Path, outcome: GenerationOutcome) -> Result<Shot, HostError> {
    match outcome {
        GenerationOutcome::Generated(image) => {
            let path = result_path(capture);
            std::fs::write(&path, &image.bytes).map_err(|source| HostError::Write {
                path: path.clone(),
                source,
            })?;
            tracing::info!(
                path = %path.display(),
                width = image.width,
                height = image.height,
                "Result written"
            );
            Ok(Shot {
                path,
                generated: true,
            })
        }
        GenerationOutcome::Fallback { reason, .. } => {
            tracing::warn!(reason = %reason, "Generation failed, keeping the captured image");
            Ok(Shot {
                path: capture.to_path_buf(),
                generated: false,
            })
        }
        GenerationOutcome::Cancelled => Err(HostError::Cancelled),
    }
}
