//! Completion polling on top of the scheduler
//!
//! Every poll is an ordinary scheduler job, so polling obeys the global
//! request rate and can be cancelled by reference like any other work.

use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::scheduler::{JobOptions, Scheduler};
use crate::slots::Category;

/// Field of the poll response that must equal an expected value
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    /// Top-level field name in the response's serialized form
    pub field: String,
    /// Value that ends the wait
    pub expected: Value,
}

impl Criterion {
    /// Wait until `field == expected`
    pub fn new(field: impl Into<String>, expected: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
        }
    }

    /// Check a response against the criterion
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] if the response does not carry
    /// the field at all.
    pub fn matches<T: Serialize>(&self, response: &T) -> Result<bool> {
        let value = serde_json::to_value(response)?;
        match value.get(&self.field) {
            Some(actual) => Ok(*actual == self.expected),
            None => Err(TransferError::Validation(Cow::Owned(format!(
                "poll response has no field `{}`",
                self.field
            )))),
        }
    }
}

struct Registration {
    token: CancellationToken,
    generation: u64,
    active: usize,
}

impl Registration {
    fn fresh(root: &CancellationToken, next_generation: &mut u64) -> Self {
        *next_generation += 1;
        Self {
            token: root.child_token(),
            generation: *next_generation,
            active: 0,
        }
    }
}

#[derive(Default)]
struct Timers {
    root: CancellationToken,
    next_generation: u64,
    by_reference: HashMap<String, Registration>,
}

/// Polls a handler until its response satisfies a [`Criterion`]
#[derive(Clone)]
pub struct Waiter {
    scheduler: Scheduler,
    interval: Duration,
    timers: Arc<Mutex<Timers>>,
}

/// Drops the wait's share of its reference token
struct WaitGuard {
    timers: Arc<Mutex<Timers>>,
    reference: String,
    generation: u64,
    token: CancellationToken,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let mut timers = lock(&self.timers);
        let release = match timers.by_reference.get_mut(&self.reference) {
            Some(entry) if entry.generation == self.generation => {
                entry.active = entry.active.saturating_sub(1);
                entry.active == 0
            }
            _ => false,
        };
        if release {
            timers.by_reference.remove(&self.reference);
        }
    }
}

fn lock(timers: &Mutex<Timers>) -> MutexGuard<'_, Timers> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Waiter {
    /// Create a waiter using the configured poll interval
    #[must_use]
    pub fn new(scheduler: Scheduler, config: &TransferConfig) -> Self {
        Self::with_interval(scheduler, config.poll_interval())
    }

    /// Create a waiter with an explicit poll interval
    #[must_use]
    pub fn with_interval(scheduler: Scheduler, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
            timers: Arc::new(Mutex::new(Timers::default())),
        }
    }

    /// Delay between polls
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Underlying scheduler
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Poll until `criterion` matches and return the matching response
    ///
    /// There is no attempt limit; the wait ends on a match, an error from
    /// the poll job, or cancellation through [`Waiter::remove`] or
    /// [`Waiter::stop`].
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] when the response lacks the
    /// criterion field, [`TransferError::Cancelled`] when removed, or the
    /// poll job's own error once its retries are exhausted.
    pub async fn push<T, F, Fut>(&self, poll: F, criterion: Criterion, reference: &str) -> Result<T>
    where
        T: Serialize + Send + 'static,
        F: FnMut() -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let guard = self.register(reference);
        let mut polls: u64 = 0;

        loop {
            if guard.token.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let job = self.scheduler.push(
                poll.clone(),
                JobOptions::new(Category::Describe).reference(reference),
            )?;
            let response = job.await?;
            polls += 1;

            if criterion.matches(&response)? {
                tracing::debug!(reference, polls, field = %criterion.field, "Wait satisfied");
                return Ok(response);
            }

            tracing::trace!(reference, polls, "Criterion not met, waiting");
            tokio::select! {
                biased;
                () = guard.token.cancelled() => return Err(TransferError::Cancelled),
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn register(&self, reference: &str) -> WaitGuard {
        let mut guard = lock(&self.timers);
        let Timers {
            root,
            next_generation,
            by_reference,
        } = &mut *guard;

        let entry = by_reference
            .entry(reference.to_string())
            .and_modify(|entry| {
                if entry.token.is_cancelled() {
                    *entry = Registration::fresh(root, next_generation);
                }
            })
            .or_insert_with(|| Registration::fresh(root, next_generation));
        entry.active += 1;

        WaitGuard {
            timers: Arc::clone(&self.timers),
            reference: reference.to_string(),
            generation: entry.generation,
            token: entry.token.clone(),
        }
    }

    /// Cancel pending waits and poll jobs for `reference`
    pub async fn remove(&self, reference: &str) {
        let entry = lock(&self.timers).by_reference.remove(reference);
        if let Some(entry) = entry {
            entry.token.cancel();
        }
        self.scheduler.remove(reference).await;
    }

    /// Cancel every wait and stop the scheduler
    pub async fn stop(&self) {
        {
            let mut timers = lock(&self.timers);
            timers.root.cancel();
            timers.by_reference.clear();
            // Fresh root so a restarted scheduler can be waited on again
            timers.root = CancellationToken::new();
        }
        self.scheduler.stop().await;
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("interval", &self.interval)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Debug, Clone, Serialize, PartialEq)]
    struct Status {
        completed: bool,
        polls: usize,
    }

    fn waiter(interval_ms: u64) -> Waiter {
        let scheduler = Scheduler::with_settings(Duration::from_millis(1), 0, 4);
        scheduler.start();
        Waiter::with_interval(scheduler, Duration::from_millis(interval_ms))
    }

    fn ready_after(
        count: usize,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut() -> BoxFuture<'static, Result<Status>> + Clone + Send + 'static {
        move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let polls = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Status {
                    completed: polls > count,
                    polls,
                })
            })
        }
    }

    #[tokio::test]
    async fn test_resolves_after_m_plus_one_polls() {
        let waiter = waiter(20);
        let calls = Arc::new(AtomicUsize::new(0));

        let started = Instant::now();
        let status = waiter
            .push(
                ready_after(3, Arc::clone(&calls)),
                Criterion::new("completed", true),
                "job-1",
            )
            .await
            .unwrap();

        assert!(status.completed);
        assert_eq!(status.polls, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_missing_field_is_validation_error() {
        let waiter = waiter(1);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = waiter
            .push(
                ready_after(0, Arc::clone(&calls)),
                Criterion::new("state", "Succeeded"),
                "job-2",
            )
            .await;

        assert!(matches!(result, Err(TransferError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_cancels_pending_wait() {
        let waiter = waiter(10_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let pending = {
            let waiter = waiter.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                waiter
                    .push(ready_after(usize::MAX - 1, calls), Criterion::new("completed", true), "job-3")
                    .await
            })
        };

        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        waiter.remove("job-3").await;

        assert_eq!(pending.await.unwrap(), Err(TransferError::Cancelled));
    }

    #[tokio::test]
    async fn test_stop_cancels_everything() {
        let waiter = waiter(10_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let pending = {
            let waiter = waiter.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                waiter
                    .push(ready_after(usize::MAX - 1, calls), Criterion::new("completed", true), "job-4")
                    .await
            })
        };

        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        waiter.stop().await;

        assert_eq!(pending.await.unwrap(), Err(TransferError::Cancelled));
        assert!(matches!(
            waiter
                .push(ready_after(0, calls), Criterion::new("completed", true), "job-5")
                .await,
            Err(TransferError::QueueNotReady)
        ));
    }

    #[tokio::test]
    async fn test_registrations_share_generation_until_cancelled() {
        let waiter = waiter(1);

        let first = waiter.register("job-6");
        let second = waiter.register("job-6");
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, first.generation);
        assert_eq!(lock(&waiter.timers).by_reference["job-6"].active, 2);

        first.token.cancel();
        let third = waiter.register("job-6");
        assert_eq!(third.generation, 2);
        assert!(!third.token.is_cancelled());

        // A stale guard does not release the newer registration
        drop(second);
        assert_eq!(lock(&waiter.timers).by_reference["job-6"].active, 1);
        drop(third);
        assert!(lock(&waiter.timers).by_reference.is_empty());
        drop(first);
    }

    #[test]
    fn test_criterion_matches() {
        let status = Status {
            completed: false,
            polls: 2,
        };
        assert!(!Criterion::new("completed", true).matches(&status).unwrap());
        assert!(Criterion::new("polls", 2).matches(&status).unwrap());
        assert!(Criterion::new("missing", 1).matches(&status).is_err());
    }
}
