//! Cancellable one-shot timers on the tokio runtime.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::task::AbortHandle;

/////////////////////////////////////////////////////////////////////////////
// TimerHandle
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub struct TimerHandle {
    task: AbortHandle,
    fired: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Runs `action` after `delay` unless cancelled first.
    pub fn spawn<F>(delay: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn({
            let fired = fired.clone();
            async move {
                tokio::time::sleep(delay).await;
                // From here on the timer can no longer be cancelled, so an
                // action re-arming its own slot never aborts itself.
                fired.store(true, Ordering::SeqCst);
                action();
            }
        });
        Self {
            task: task.abort_handle(),
            fired,
        }
    }

    /// Returns true if the timer was still pending and is now cancelled.
    pub fn cancel(&self) -> bool {
        if self.is_pending() {
            self.task.abort();
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.fired.load(Ordering::SeqCst) && !self.task.is_finished()
    }
}

/////////////////////////////////////////////////////////////////////////////
// TimerSlot
/////////////////////////////////////////////////////////////////////////////

/// A place for at most one pending timer.
#[derive(Debug, Default)]
pub struct TimerSlot {
    current: Mutex<Option<TimerHandle>>,
    armed: AtomicUsize,
}

impl TimerSlot {
    pub fn new() -> Self { Self::default() }

    /// Cancels the pending timer (if any) and arms a new one.
    pub fn arm<F>(&self, delay: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut current = self.current.lock();
        if let Some(previous) = current.take() {
            previous.cancel();
        }
        *current = Some(TimerHandle::spawn(delay, action));
        self.armed.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true if a pending timer was cancelled.
    pub fn cancel(&self) -> bool {
        self.current
            .lock()
            .take()
            .map(|timer| timer.cancel())
            .unwrap_or(false)
    }

    pub fn is_pending(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(TimerHandle::is_pending)
            .unwrap_or(false)
    }

    /// Number of timers armed since creation or the last [Self::reset_count].
    pub fn armed_count(&self) -> usize { self.armed.load(Ordering::SeqCst) }

    pub fn reset_count(&self) { self.armed.store(0, Ordering::SeqCst); }
}

impl Drop for TimerSlot {
    fn drop(&mut self) { self.cancel(); }
}
