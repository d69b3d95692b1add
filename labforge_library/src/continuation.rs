use crate::clock::now;
use crate::transaction::TransactionId;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

lazy_static::lazy_static! {
  /// A global [Continuation] so background loops learn about an exit signal
  pub static ref GLOB_CONT_CHECK: Continuation = Continuation::new();
  /// Woken on application exit, for loops that block on a channel or notification
  pub static ref GLOB_NOTIFIER: Notify = Notify::new();
}

/// Tracks background loops and tells them when the application is exiting.
/// Loops call `thread_start`, run while `check_continue` returns [true], then call `thread_exit`.
pub struct Continuation {
    signal: AtomicBool,
    outstanding_threads: AtomicU32,
}

impl Continuation {
    fn new() -> Self {
        Continuation {
            signal: AtomicBool::new(true),
            outstanding_threads: AtomicU32::new(0),
        }
    }

    /// Signal all registered loops to exit.
    /// Returns after all have exited, or after `wait` elapses.
    pub async fn signal_application_exit(&self, wait: Duration, tid: &TransactionId) {
        self.signal.store(false, Ordering::SeqCst);
        GLOB_NOTIFIER.notify_waiters();
        info!(tid = tid, "Signalling background exit");
        let start = now();
        while self.outstanding_threads.load(Ordering::SeqCst) > 0 {
            if start.elapsed() > wait {
                warn!(
                    tid = tid,
                    outstanding = self.outstanding_threads.load(Ordering::SeqCst),
                    "Background loops did not exit in time"
                );
                break;
            }
            GLOB_NOTIFIER.notify_waiters();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn thread_start(&self, tid: &TransactionId) {
        self.outstanding_threads.fetch_add(1, Ordering::SeqCst);
        debug!(tid = tid, "New thread start registered with Continuation");
    }

    pub fn thread_exit(&self, tid: &TransactionId) {
        self.outstanding_threads.fetch_sub(1, Ordering::SeqCst);
        debug!(tid = tid, "Thread exit registered with Continuation");
    }

    /// Returns true if the application should continue running
    pub fn check_continue(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding_threads.load(Ordering::SeqCst)
    }
}
