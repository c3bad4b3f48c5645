// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Completion callbacks.
//!
//! Announcement requests complete asynchronously, often as part of a batch
//! drain triggered by some other caller's store operation. A [`Callback`] is
//! the one-shot continuation a caller hands in; [`Callback::channel`] pairs it
//! with a [`Completion`] future for callers that prefer to `.await`.

use crate::error::AnnounceError;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type CallbackFn = Box<dyn FnOnce(Result<(), AnnounceError>) + Send + 'static>;

/// One-shot completion continuation.
pub struct Callback {
    f: CallbackFn,
}

impl Callback {
    /// Wrap a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Result<(), AnnounceError>) + Send + 'static,
    {
        Self { f: Box::new(f) }
    }

    /// A callback that ignores its outcome.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// A callback that only logs its outcome.
    pub fn logging(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self::new(move |result| log_outcome(&operation, &result))
    }

    /// A callback paired with a future resolving to its outcome.
    pub fn channel() -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let callback = Self::new(move |result| {
            // The receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        });
        (callback, Completion { rx })
    }

    /// Log the outcome, then pass it on to this callback.
    pub fn logged(self, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self::new(move |result| {
            log_outcome(&operation, &result);
            self.complete(result);
        })
    }

    /// Deliver an outcome.
    pub fn complete(self, result: Result<(), AnnounceError>) {
        (self.f)(result)
    }

    /// Deliver success.
    pub fn succeed(self) {
        self.complete(Ok(()))
    }

    /// Deliver a failure.
    pub fn fail(self, err: impl Into<AnnounceError>) {
        self.complete(Err(err.into()))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish_non_exhaustive()
    }
}

fn log_outcome(operation: &str, result: &Result<(), AnnounceError>) {
    match result {
        Ok(()) => debug!("{} succeeded", operation),
        Err(e) if e.is_cancelled() => debug!("{}: {}", operation, e),
        Err(e) => warn!("{} failed: {}", operation, e),
    }
}

/// Future side of [`Callback::channel`].
///
/// Resolves to [`AnnounceError::Abandoned`] if the callback is dropped
/// without being completed.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), AnnounceError>>,
}

impl Completion {
    /// Non-blocking check: `None` while the callback has not fired yet.
    pub fn try_result(&mut self) -> Option<Result<(), AnnounceError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(AnnounceError::Abandoned)),
        }
    }
}

impl Future for Completion {
    type Output = Result<(), AnnounceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(AnnounceError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Count-down combinator.
///
/// Returns `total` child callbacks. `outer` succeeds once every child has
/// succeeded, or fails with the first child error; later child outcomes are
/// ignored. With `total == 0` the outer callback succeeds immediately.
pub fn fan_in(total: usize, outer: Callback) -> Vec<Callback> {
    if total == 0 {
        outer.succeed();
        return Vec::new();
    }

    let shared = Arc::new(FanIn {
        remaining: AtomicUsize::new(total),
        outer: Mutex::new(Some(outer)),
    });

    (0..total)
        .map(|_| {
            let shared = Arc::clone(&shared);
            Callback::new(move |result| shared.child_done(result))
        })
        .collect()
}

struct FanIn {
    remaining: AtomicUsize,
    outer: Mutex<Option<Callback>>,
}

impl FanIn {
    fn child_done(&self, result: Result<(), AnnounceError>) {
        match result {
            Ok(()) => {
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let outer = self.outer.lock().take();
                    if let Some(outer) = outer {
                        outer.succeed();
                    }
                }
            }
            Err(e) => {
                let outer = self.outer.lock().take();
                if let Some(outer) = outer {
                    outer.fail(e);
                }
            }
        }
    }
}
