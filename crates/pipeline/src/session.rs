//! The booth's front-facing surface.
//!
//! [`BoothSession`] bundles style selection, the pre-capture countdown
//! and the generation worker behind the calls a UI sequencer makes.

use std::sync::Arc;
use std::time::Duration;

use snapbooth_core::error::CoreError;
use snapbooth_core::types::Percent;

use crate::config::BoothConfig;
use crate::countdown::{CountdownTimer, DEFAULT_TICK_INTERVAL};
use crate::runner::{GenerationOutcome, GenerationRequest, JobRunner, SourceImage};
use crate::worker::GenerationWorker;

/// The calls a booth front end drives: style choice, the countdown
/// before capture, and generation of the captured photo.
///
/// Callbacks run on background threads. Hosts typically forward them
/// into their own event loop.
pub struct BoothSession {
    runner: Arc<JobRunner>,
    worker: GenerationWorker,
    countdown: CountdownTimer,
    countdown_start: u32,
    selected_style: Option<String>,
}

impl BoothSession {
    pub fn new(runner: Arc<JobRunner>, countdown_start: u32, tick_interval: Duration) -> Self {
        Self {
            worker: GenerationWorker::new(Arc::clone(&runner)),
            runner,
            countdown: CountdownTimer::new(tick_interval),
            countdown_start,
            selected_style: None,
        }
    }

    pub fn from_config(config: &BoothConfig) -> Result<Self, CoreError> {
        let runner = JobRunner::from_config(config)?;
        Ok(Self::new(
            Arc::new(runner),
            config.countdown_start,
            DEFAULT_TICK_INTERVAL,
        ))
    }

    /// Style names in catalog order.
    pub fn styles(&self) -> Vec<String> {
        self.runner.catalog().names().map(str::to_string).collect()
    }

    /// Select `style` for the next generation.
    ///
    /// Fails with `UnknownStyle` when the catalog lacks it and with
    /// `TemplateNotFound` when no profile (not even the default) exists.
    pub fn select_style(&mut self, style: &str) -> Result<(), CoreError> {
        self.runner.catalog().get(style)?;
        let profile = self.runner.profiles().resolve(style)?;
        tracing::info!(style, profile = %profile.display(), "Style selected");
        self.selected_style = Some(style.to_string());
        Ok(())
    }

    pub fn selected_style(&self) -> Option<&str> {
        self.selected_style.as_deref()
    }

    pub fn countdown_start(&self) -> u32 {
        self.countdown_start
    }

    pub fn start_countdown<T, F>(&mut self, count: u32, on_tick: T, on_finished: F) -> bool
    where
        T: FnMut(u32) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.countdown.start(count, on_tick, on_finished)
    }

    pub fn stop_countdown(&mut self) {
        self.countdown.stop();
    }

    pub fn is_counting_down(&self) -> bool {
        self.countdown.is_running()
    }

    /// Generate `source` in `style`. Unknown styles fall back to the
    /// first catalog entry. Returns `false` if a generation is already
    /// in flight.
    pub fn start_generation<P, F>(
        &mut self,
        style: &str,
        source: SourceImage,
        on_progress: P,
        on_finished: F,
    ) -> bool
    where
        P: FnMut(Percent) + Send + 'static,
        F: FnOnce(GenerationOutcome) + Send + 'static,
    {
        let request = GenerationRequest {
            style: style.to_string(),
            source,
        };
        self.worker.start(request, on_progress, on_finished)
    }

    /// Generate with the selected style, or the catalog default.
    pub fn start_selected_generation<P, F>(
        &mut self,
        source: SourceImage,
        on_progress: P,
        on_finished: F,
    ) -> bool
    where
        P: FnMut(Percent) + Send + 'static,
        F: FnOnce(GenerationOutcome) + Send + 'static,
    {
        let style = self.selected_style.clone().unwrap_or_default();
        self.start_generation(&style, source, on_progress, on_finished)
    }

    pub fn cancel_generation(&self) {
        self.worker.cancel();
    }

    pub fn is_generating(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop the countdown and release the generation thread.
    pub fn shutdown(&mut self) {
        self.countdown.stop();
        self.worker.cleanup();
    }
}

impl Drop for BoothSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
