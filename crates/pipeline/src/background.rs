//! Background threads and the callback slots they report through.
//!
//! Every job and every countdown gets its own OS thread driving a
//! current-thread tokio runtime, so the caller's thread never blocks on
//! network or timer waits.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// A named OS thread running one future to completion.
pub(crate) struct BackgroundThread {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundThread {
    /// Build the runtime here so that failures surface to the caller
    /// instead of dying silently on the new thread.
    pub(crate) fn spawn<F, Fut>(name: &str, task: F) -> std::io::Result<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runtime.block_on(task()))?;

        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Join the thread, or detach it when called from the thread itself.
    pub(crate) fn join_or_detach(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if handle.thread().id() == std::thread::current().id() {
            tracing::debug!(thread = %self.name, "Detaching background thread from itself");
            return;
        }
        if handle.join().is_err() {
            tracing::error!(thread = %self.name, "Background thread panicked");
        }
    }
}

impl Drop for BackgroundThread {
    fn drop(&mut self) {
        self.join_or_detach();
    }
}

// ---------------------------------------------------------------------------
// Callback slots
// ---------------------------------------------------------------------------

/// Holds a completion callback that can be invoked at most once,
/// whichever of several racing parties gets there first.
pub(crate) struct FinishSlot<T> {
    slot: Arc<Mutex<Option<Box<dyn FnOnce(T) + Send>>>>,
}

impl<T> Clone for FinishSlot<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> FinishSlot<T> {
    pub(crate) fn new(callback: Box<dyn FnOnce(T) + Send>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(callback))),
        }
    }

    /// Returns `false` if the callback already fired.
    pub(crate) fn deliver(&self, value: T) -> bool {
        let callback = lock(&self.slot).take();
        match callback {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }

    /// Drop the callback without calling it.
    pub(crate) fn disarm(&self) -> bool {
        lock(&self.slot).take().is_some()
    }

    pub(crate) fn is_spent(&self) -> bool {
        lock(&self.slot).is_none()
    }
}

struct RelayState<T> {
    callback: Option<Box<dyn FnMut(T) + Send>>,
    closed: bool,
}

/// Forwards notifications until closed. Nothing is delivered after
/// `close`.
///
/// The callback runs without the lock held, so it may call back into the
/// owner (for example to cancel).
pub(crate) struct Relay<T> {
    state: Arc<Mutex<RelayState<T>>>,
}

impl<T> Clone for Relay<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Relay<T> {
    pub(crate) fn new(callback: Box<dyn FnMut(T) + Send>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                callback: Some(callback),
                closed: false,
            })),
        }
    }

    pub(crate) fn emit(&self, value: T) {
        let taken = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.callback.take()
        };
        let Some(mut callback) = taken else {
            return;
        };

        callback(value);

        let mut state = lock(&self.state);
        if !state.closed {
            state.callback = Some(callback);
        }
    }

    pub(crate) fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.callback = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn finish_slot_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let slot = FinishSlot::<usize>::new(Box::new(move |n: usize| {
            counter.fetch_add(n, Ordering::SeqCst);
        }));
        let other = slot.clone();

        assert!(slot.deliver(1));
        assert!(!other.deliver(10));
        assert!(slot.is_spent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarmed_slot_never_fires() {
        let slot = FinishSlot::<()>::new(Box::new(|_: ()| panic!("should not fire")));
        assert!(slot.disarm());
        assert!(!slot.deliver(()));
    }

    #[test]
    fn relay_stops_after_close() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let relay = Relay::<f64>::new(Box::new(move |p: f64| sink.lock().unwrap().push(p)));

        relay.emit(10.0);
        relay.close();
        relay.emit(20.0);

        assert_eq!(*seen.lock().unwrap(), vec![10.0]);
    }

    #[test]
    fn relay_callback_may_close_its_own_relay() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle: Arc<Mutex<Option<Relay<f64>>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&handle);
        let relay = Relay::<f64>::new(Box::new(move |_: f64| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(relay) = inner.lock().unwrap().as_ref() {
                relay.close();
            }
        }));
        *handle.lock().unwrap() = Some(relay.clone());

        relay.emit(1.0);
        relay.emit(2.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_runs_future_and_joins() {
        let done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&done);
        let mut thread = BackgroundThread::spawn("test-bg", move || async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.store(1, Ordering::SeqCst);
        })
        .unwrap();

        thread.join_or_detach();
        assert!(thread.is_finished());
        assert_eq!(done.load(Ordering::SeqCst), 1);
        thread.join_or_detach();
    }
}
