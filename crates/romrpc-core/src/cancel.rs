//! Cancellation token for session background loops.
//!
//! A session owns one reconnect loop and one keep-alive loop. Both hold a
//! clone of the session's token and stop when it is cancelled, either by
//! polling [`CancellationToken::is_cancelled`] or by awaiting
//! [`CancellationToken::cancelled`] inside a `tokio::select!`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation token shared between a session and its background tasks.
///
/// Cloning shares state: cancelling any clone cancels all of them.
///
/// # Example
///
/// ```
/// use romrpc::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let loop_token = token.clone();
///
/// token.cancel();
/// assert!(loop_token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every task parked in [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Return `Err(Closed)` if cancellation has been requested.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::RomError::Closed)
        } else {
            Ok(())
        }
    }
}
