//! Runs one generation at a time on a background thread.
//!
//! Every accepted [`GenerationWorker::start`] produces exactly one
//! `on_finished` call: the runner's outcome, or
//! [`GenerationOutcome::Cancelled`] as soon as [`cancel`] is called,
//! whichever comes first. Progress stops the moment a job is cancelled.
//!
//! Cancelling only stops local waiting. A job already queued on the
//! ComfyUI server keeps running there.
//!
//! [`cancel`]: GenerationWorker::cancel

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use snapbooth_core::types::Percent;

use crate::background::{BackgroundThread, FinishSlot, Relay};
use crate::runner::{GenerationOutcome, GenerationRequest, JobRunner};

const THREAD_NAME: &str = "snapbooth-generation";

struct ActiveJob {
    cancel: CancellationToken,
    progress: Relay<Percent>,
    finish: FinishSlot<GenerationOutcome>,
    thread: BackgroundThread,
}

impl ActiveJob {
    fn cancel(&self) -> bool {
        self.cancel.cancel();
        self.progress.close();
        self.finish.deliver(GenerationOutcome::Cancelled)
    }
}

/// Lifecycle owner for background generation jobs.
pub struct GenerationWorker {
    runner: Arc<JobRunner>,
    active: Option<ActiveJob>,
}

impl GenerationWorker {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self {
            runner,
            active: None,
        }
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// A job has been started and has not delivered its outcome yet.
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|job| !job.finish.is_spent())
    }

    /// Start `request` in the background.
    ///
    /// Returns `false` without touching the callbacks when a job is
    /// already in flight.
    pub fn start<P, F>(&mut self, request: GenerationRequest, on_progress: P, on_finished: F) -> bool
    where
        P: FnMut(Percent) + Send + 'static,
        F: FnOnce(GenerationOutcome) + Send + 'static,
    {
        if self.is_running() {
            tracing::warn!(style = %request.style, "Generation already in progress, ignoring start");
            return false;
        }
        // Reap the previous job's thread.
        self.cleanup();

        let cancel = CancellationToken::new();
        let progress = Relay::<Percent>::new(Box::new(on_progress));
        let finish = FinishSlot::<GenerationOutcome>::new(Box::new(on_finished));
        let fallback = request.source.clone();

        let runner = Arc::clone(&self.runner);
        let task_cancel = cancel.clone();
        let task_progress = progress.clone();
        let task_finish = finish.clone();
        let spawned = BackgroundThread::spawn(THREAD_NAME, move || async move {
            let outcome = runner
                .run(&request, &mut |percent| task_progress.emit(percent), &task_cancel)
                .await;
            task_progress.close();
            if !task_finish.deliver(outcome) {
                tracing::debug!("Outcome dropped, job was already finished");
            }
        });

        match spawned {
            Ok(thread) => {
                tracing::info!("Generation started");
                self.active = Some(ActiveJob {
                    cancel,
                    progress,
                    finish,
                    thread,
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start generation thread");
                progress.close();
                finish.deliver(GenerationOutcome::Fallback {
                    image: fallback,
                    reason: format!("failed to start generation thread: {e}"),
                });
            }
        }
        true
    }

    /// Stop waiting for the current job and report it cancelled now.
    ///
    /// No-op when nothing is in flight.
    pub fn cancel(&self) {
        if let Some(job) = &self.active {
            if job.cancel() {
                tracing::info!("Generation cancelled");
            }
        }
    }

    /// Cancel anything in flight and release the thread. Idempotent.
    ///
    /// Joins the thread, or detaches it when called from the job's own
    /// callbacks.
    pub fn cleanup(&mut self) {
        if let Some(mut job) = self.active.take() {
            job.cancel();
            job.thread.join_or_detach();
            tracing::debug!("Generation worker cleaned up");
        }
    }
}

impl Drop for GenerationWorker {
    fn drop(&mut self) {
        self.cleanup();
    }
}
