//! Delayed task scheduling with opaque cancellation tokens.
//!
//! Owners hold a [`TimerToken`] rather than a reference to the scheduled task,
//! and scheduled tasks hold weak references back into their owner, so no
//! reference cycle is formed between a query and its timer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;
use tokio::time::{sleep, Duration};

/// Handle returned by [`Timer::schedule`], used to cancel the task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// A single logical timer shared by every pending query.
#[derive(Clone, Default)]
pub struct Timer {
    next_token: Arc<AtomicU64>,
    tasks: Arc<Mutex<HashMap<TimerToken, AbortHandle>>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the future built by `task` after `delay` unless cancelled first.
    ///
    /// `task` receives the token of its own firing. Once the delay elapses the
    /// token is no longer cancellable, so an owner that may have re-armed in
    /// the meantime should compare it with the token it currently holds.
    pub fn schedule<T, F>(&self, delay: Duration, task: T) -> TimerToken
    where
        T: FnOnce(TimerToken) -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let tasks = self.tasks.clone();
        // Hold the map lock across spawn so a zero delay task cannot remove
        // its entry before it is inserted.
        let mut guard = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            lock(&tasks).remove(&token);
            task(token).await;
        });
        guard.insert(token, handle.abort_handle());
        token
    }

    /// Cancel a scheduled task. Returns `false` when it already ran or was
    /// cancelled before.
    pub fn cancel(&self, token: TimerToken) -> bool {
        match lock(&self.tasks).remove(&token) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every scheduled task.
    pub fn cancel_all(&self) {
        let drained: Vec<AbortHandle> = lock(&self.tasks).drain().map(|(_, h)| h).collect();
        for handle in drained {
            handle.abort();
        }
    }

    /// Number of tasks that have neither run nor been cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }
}

fn lock(
    tasks: &Mutex<HashMap<TimerToken, AbortHandle>>,
) -> std::sync::MutexGuard<'_, HashMap<TimerToken, AbortHandle>> {
    // A panic inside the map operations cannot leave it inconsistent.
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
