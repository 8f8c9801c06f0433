//! Callback style for every client operation.
//!
//! A [`Continuation`] is completed exactly once, from a runtime worker task,
//! never inline on the caller's stack.

use crate::{Result, RomError};
use std::future::Future;
use tokio::runtime::Handle;
use tracing::warn;

enum Callbacks<T> {
    Split {
        on_success: Box<dyn FnOnce(T) + Send>,
        on_error: Box<dyn FnOnce(RomError) + Send>,
    },
    Whole(Box<dyn FnOnce(Result<T>) + Send>),
}

pub struct Continuation<T> {
    callbacks: Callbacks<T>,
}

impl<T> Continuation<T> {
    pub fn new(
        on_success: impl FnOnce(T) + Send + 'static,
        on_error: impl FnOnce(RomError) + Send + 'static,
    ) -> Self {
        Self {
            callbacks: Callbacks::Split {
                on_success: Box::new(on_success),
                on_error: Box::new(on_error),
            },
        }
    }

    /// One callback receiving the whole result.
    pub fn from_fn(f: impl FnOnce(Result<T>) + Send + 'static) -> Self {
        Self {
            callbacks: Callbacks::Whole(Box::new(f)),
        }
    }

    pub(crate) fn complete(self, result: Result<T>) {
        match self.callbacks {
            Callbacks::Split {
                on_success,
                on_error,
            } => match result {
                Ok(value) => on_success(value),
                Err(e) => on_error(e),
            },
            Callbacks::Whole(f) => f(result),
        }
    }
}

/// Run `future` on `runtime` (or the ambient one) and hand its result to
/// `continuation`.
pub(crate) fn spawn_with<T, F>(runtime: Option<&Handle>, future: F, continuation: Continuation<T>)
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match runtime.cloned().or_else(|| Handle::try_current().ok()) {
        Some(handle) => {
            handle.spawn(async move {
                continuation.complete(future.await);
            });
        }
        None => {
            warn!("No async runtime to run the operation on");
            std::thread::spawn(move || {
                continuation.complete(Err(RomError::transport(
                    "no async runtime available to run the operation",
                )));
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_success_callback_is_not_inline() {
        let completed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        let flag = completed.clone();
        let continuation = Continuation::new(
            move |v: u32| {
                flag.store(true, Ordering::SeqCst);
                let _ = tx.send(v);
            },
            |e| panic!("unexpected error: {}", e),
        );
        spawn_with(None, async { Ok(7) }, continuation);
        // Current-thread runtime: nothing runs until this task yields.
        assert!(!completed.load(Ordering::SeqCst));
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_error_callback() {
        let (tx, rx) = oneshot::channel();
        let continuation: Continuation<()> = Continuation::new(
            |_| panic!("unexpected success"),
            move |e| {
                let _ = tx.send(e);
            },
        );
        spawn_with(None, async { Err(RomError::Closed) }, continuation);
        assert!(matches!(rx.await.unwrap(), RomError::Closed));
    }

    #[test]
    fn test_without_runtime_reports_error() {
        let (tx, rx) = std::sync::mpsc::channel();
        spawn_with(
            None,
            async { Ok(1) },
            Continuation::from_fn(move |r: Result<i32>| {
                let _ = tx.send(r.is_err());
            }),
        );
        assert!(rx.recv().unwrap());
    }
}
