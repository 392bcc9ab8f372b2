//! A minimal cancellation signal shared by `bqueue`, `vc`, and `vif`.
//!
//! This stands in for the "cancel signal" the spec threads through every
//! blocking operation (§4.1, §5). It is deliberately small: a flag plus a
//! `Notify` so any number of waiters can select on `cancelled()`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. If already cancelled,
    /// resolves immediately on the next poll.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }

    /// A token that never cancels, for call sites with no cancellation
    /// source of their own.
    pub fn never() -> Self {
        Self::new()
    }
}
