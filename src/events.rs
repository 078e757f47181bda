//! Manual-reset events for the single-threaded engine loop.

use std::cell::Cell;
use tokio::sync::Notify;

/// A level-triggered event: `set` latches it, `wait` resumes immediately
/// while latched, `clear` re-arms it.
///
/// The engine owns two of these: `jobs_added`, consumed by the worker-pool
/// loops, and `appearance_changed`, consumed by whatever is rendering the
/// matrix. All accesses happen on the engine's event-loop thread.
#[derive(Debug, Default)]
pub struct Event {
    flag: Cell<bool>,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Event::default()
    }

    pub fn set(&self) {
        self.flag.set(true);
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.flag.set(false);
    }

    pub fn is_set(&self) -> bool {
        self.flag.get()
    }

    /// Suspends until the event is set. Returns immediately when already
    /// set; does not clear the flag.
    pub async fn wait(&self) {
        loop {
            if self.flag.get() {
                return;
            }
            let notified = self.notify.notified();
            if self.flag.get() {
                return;
            }
            notified.await;
        }
    }
}
