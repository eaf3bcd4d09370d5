//! Cooperative gate
//!
//! One side parks with [`Gate::wait`], the other resumes it with
//! [`Gate::signal`]. A signal with nobody waiting is remembered (at most one)
//! so the next wait returns at once. Closing the gate releases every waiter
//! and makes later waits return [`Wake::Closed`] immediately; signals after
//! close are ignored.

use std::cell::Cell;
use tokio::sync::Notify;

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Signaled,
    Closed,
}

#[derive(Debug, Default)]
pub struct Gate {
    notify: Notify,
    closed: Cell<bool>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until signaled or closed.
    pub async fn wait(&self) -> Wake {
        if self.closed.get() {
            return Wake::Closed;
        }
        self.notify.notified().await;
        if self.closed.get() { Wake::Closed } else { Wake::Signaled }
    }

    /// Resume one waiter, or leave a permit for the next wait.
    pub fn signal(&self) {
        if !self.closed.get() {
            self.notify.notify_one();
        }
    }

    /// Release all waiters for good.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.notify.notify_waiters();
        // Covers a waiter that registered between the closed check and the park.
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}
