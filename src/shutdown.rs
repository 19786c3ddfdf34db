//! Cancellation coordination utilities.
//!
//! A [`ShutdownCoordinator`] is a cancel token that can be shared across
//! tasks. Tokens form a tree: cancelling a parent (Ctrl+C in the CLI) cancels
//! every child created from it, while cancelling a child (one dropped `get`)
//! leaves the parent and its siblings running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// Shared handle to a shutdown coordinator.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

/// Coordinates cancellation across async tasks.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    is_shutdown: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<ShutdownCoordinator>>>,
}

impl ShutdownCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new shared coordinator wrapped in [`Arc`].
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Create a token that is cancelled whenever `self` is.
    pub fn child(&self) -> SharedShutdown {
        let child = Self::shared();
        if self.is_shutdown_requested() {
            child.request_shutdown();
            return child;
        }

        let mut children = match self.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        children.retain(|weak| weak.strong_count() > 0);
        children.push(Arc::downgrade(&child));
        drop(children);

        // Parent may have been cancelled while we registered
        if self.is_shutdown_requested() {
            child.request_shutdown();
        }
        child
    }

    /// Request shutdown. Notifies all waiters and children exactly once.
    pub fn request_shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();

        let children = match self.children.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.request_shutdown();
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested. Returns immediately if already set.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }
}

/// Cancels its token when dropped.
///
/// Held by a `get` future so that dropping the future stops further retries.
#[derive(Debug)]
pub struct CancelOnDrop {
    token: SharedShutdown,
    armed: bool,
}

impl CancelOnDrop {
    /// Guard `token`.
    pub fn new(token: SharedShutdown) -> Self {
        Self { token, armed: true }
    }

    /// Let the call finish without cancelling the token.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.token.request_shutdown();
        }
    }
}
