// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deferred execution used by the dark-warmup timer.

use std::time::Duration;
use tokio::runtime::Handle;

/// Task run once by a [`Scheduler`].
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: ScheduledTask);
}

/// Scheduler backed by tokio timers.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Scheduler on the runtime of the calling context.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn test_runs_after_delay() {
        let scheduler = TokioScheduler::current().expect("runtime");
        let (tx, rx) = oneshot::channel();
        let start = tokio::time::Instant::now();

        scheduler.schedule(
            Duration::from_secs(5),
            Box::new(move || {
                let _ = tx.send(tokio::time::Instant::now());
            }),
        );

        let fired = rx.await.expect("task ran");
        assert!(fired - start >= Duration::from_secs(5));
    }

    #[test]
    fn test_current_outside_runtime() {
        assert!(TokioScheduler::current().is_none());
    }
}
