// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A small task scheduler on top of a tokio runtime.
//!
//! All work scheduled by the capture engine goes through a [`Scheduler`], so
//! that shutting it down leaves no orphaned tasks behind.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    runtime::Handle,
    task::{AbortHandle, JoinSet},
};

/// Cloneable handle to a set of scheduled tasks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    handle: Handle,
    // None once shut down
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Scheduler {
    /// A scheduler running tasks on `handle`.
    pub fn new(handle: Handle) -> Self {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                handle,
                tasks: Mutex::new(Some(JoinSet::new())),
            }),
        }
    }

    /// A scheduler on the current tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Run `task` now. Returns `None` if the scheduler was shut down.
    pub fn spawn<F>(&self, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(tasks) = guard.as_mut() else {
            tracing::warn!("scheduler is shut down, dropping task");
            return None;
        };
        reap(tasks);
        Some(tasks.spawn_on(task, &self.inner.handle))
    }

    /// Run `task` once `delay` has elapsed.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        })
    }

    /// Call `task` after `initial_delay`, then every `period`, until aborted.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        mut task: F,
    ) -> Option<AbortHandle>
    where
        F: FnMut() + Send + 'static,
    {
        self.spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task();
            }
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Abort every scheduled task and wait for them to finish.
    pub async fn shutdown(&self) {
        let tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut tasks) = tasks {
            tracing::debug!(pending = tasks.len(), "shutting down scheduler");
            tasks.shutdown().await;
        }
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(err) = result {
            if err.is_panic() {
                tracing::error!(?err, "scheduled task panicked");
            }
        }
    }
}
