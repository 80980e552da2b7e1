//! Cancelable countdown before capture.
//!
//! ```text
//! Idle -> Running -> Finished
//!   ^________|__________|      stop()
//! ```
//!
//! A countdown from `n` ticks `n, n-1, ..., 0`, one interval apart, then
//! reports finished exactly once. `stop()` silences both ticks and the
//! finish notification.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::background::{BackgroundThread, FinishSlot, Relay};

const THREAD_NAME: &str = "snapbooth-countdown";

/// Interval between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownState {
    Idle,
    Running,
    Finished,
}

struct ActiveCountdown {
    cancel: CancellationToken,
    ticks: Relay<u32>,
    finish: FinishSlot<()>,
    state: Arc<Mutex<CountdownState>>,
    thread: BackgroundThread,
}

pub struct CountdownTimer {
    interval: Duration,
    active: Option<ActiveCountdown>,
}

impl Default for CountdownTimer {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}

impl CountdownTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            active: None,
        }
    }

    pub fn state(&self) -> CountdownState {
        match &self.active {
            Some(countdown) => *countdown
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            None => CountdownState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == CountdownState::Running
    }

    /// Start counting down from `count`. No-op returning `false` while a
    /// countdown is already running.
    pub fn start<T, F>(&mut self, count: u32, on_tick: T, on_finished: F) -> bool
    where
        T: FnMut(u32) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        if self.is_running() {
            tracing::debug!("Countdown already running, ignoring start");
            return false;
        }
        self.stop();

        let cancel = CancellationToken::new();
        let ticks = Relay::<u32>::new(Box::new(on_tick));
        let finish = FinishSlot::<()>::new(Box::new(move |()| on_finished()));
        let state = Arc::new(Mutex::new(CountdownState::Running));

        let interval = self.interval;
        let task_cancel = cancel.clone();
        let task_ticks = ticks.clone();
        let task_finish = finish.clone();
        let task_state = Arc::clone(&state);
        let spawned = BackgroundThread::spawn(THREAD_NAME, move || async move {
            for remaining in (0..=count).rev() {
                if task_cancel.is_cancelled() {
                    return;
                }
                tracing::debug!(remaining, "Countdown tick");
                task_ticks.emit(remaining);
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            task_ticks.close();
            *task_state.lock().unwrap_or_else(PoisonError::into_inner) = CountdownState::Finished;
            if task_finish.deliver(()) {
                tracing::info!("Countdown finished");
            }
        });

        match spawned {
            Ok(thread) => {
                self.active = Some(ActiveCountdown {
                    cancel,
                    ticks,
                    finish,
                    state,
                    thread,
                });
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start countdown thread");
                false
            }
        }
    }

    /// Halt ticking without a finish notification and return to `Idle`.
    /// Idempotent, and safe to call from the countdown's own callbacks.
    pub fn stop(&mut self) {
        if let Some(mut countdown) = self.active.take() {
            let silenced = countdown.finish.disarm();
            countdown.ticks.close();
            countdown.cancel.cancel();
            countdown.thread.join_or_detach();
            if silenced {
                tracing::info!("Countdown stopped");
            }
        }
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    const FAST: Duration = Duration::from_millis(20);
    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, PartialEq)]
    enum Event {
        Tick(u32),
        Finished,
    }

    fn start(timer: &mut CountdownTimer, count: u32) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        let finished_tx = tx.clone();
        assert!(timer.start(
            count,
            move |n| {
                let _ = tx.send(Event::Tick(n));
            },
            move || {
                let _ = finished_tx.send(Event::Finished);
            },
        ));
        rx
    }

    #[test]
    fn counts_down_through_zero_then_finishes_once() {
        let mut timer = CountdownTimer::new(FAST);
        let rx = start(&mut timer, 2);

        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(WAIT) {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![Event::Tick(2), Event::Tick(1), Event::Tick(0), Event::Finished]
        );
        assert_eq!(timer.state(), CountdownState::Finished);
    }

    #[test]
    fn stop_after_tick_one_suppresses_finish() {
        let mut timer = CountdownTimer::new(Duration::from_millis(200));
        let rx = start(&mut timer, 2);

        assert_eq!(rx.recv_timeout(WAIT), Ok(Event::Tick(2)));
        assert_eq!(rx.recv_timeout(WAIT), Ok(Event::Tick(1)));
        timer.stop();

        assert_eq!(timer.state(), CountdownState::Idle);
        // The timer dropped its callbacks, so the channel disconnects.
        assert_eq!(rx.recv_timeout(WAIT), Err(mpsc::RecvTimeoutError::Disconnected));
    }

    #[test]
    fn start_while_running_is_ignored() {
        let mut timer = CountdownTimer::new(Duration::from_millis(200));
        let _rx = start(&mut timer, 3);

        assert!(!timer.start(1, |_| {}, || {}));
        assert!(timer.is_running());
        timer.stop();
        timer.stop();
        assert_eq!(timer.state(), CountdownState::Idle);
    }

    #[test]
    fn restart_after_finish() {
        let mut timer = CountdownTimer::new(FAST);
        let rx = start(&mut timer, 0);
        assert_eq!(rx.recv_timeout(WAIT), Ok(Event::Tick(0)));
        assert_eq!(rx.recv_timeout(WAIT), Ok(Event::Finished));

        let rx = start(&mut timer, 1);
        assert_eq!(rx.recv_timeout(WAIT), Ok(Event::Tick(1)));
        assert_eq!(rx.recv_timeout(WAIT), Ok(Event::Tick(0)));
        assert_eq!(rx.recv_timeout(WAIT), Ok(Event::Finished));
    }
}
