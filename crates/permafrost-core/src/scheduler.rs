//! Rate-limited, retrying, cancelable job scheduler
//!
//! Jobs are admitted by a fixed-rate ticker: every tick scans the queue from
//! the front and starts the first job whose category has a free slot. At
//! most one job is admitted per tick, so the tick rate is the global request
//! rate. The ticker stops itself when the queue drains and is restarted by
//! the next push. A transient failure keeps its slot and retries after one
//! tick, so a failing job never calls out faster than the admission rate.
//!
//! # Lifecycle
//!
//! ```text
//!   Pending --start()--> Processing --stop()--> Pending
//! ```
//!
//! Pushing while `Pending` fails immediately with
//! [`TransferError::QueueNotReady`].
//!
//! # Example
//!
//! ```no_run
//! use permafrost_core::scheduler::{JobOptions, Scheduler};
//! use permafrost_core::slots::Category;
//! use permafrost_core::TransferConfig;
//!
//! # async fn demo() -> permafrost_core::Result<()> {
//! let scheduler = Scheduler::new(&TransferConfig::default());
//! scheduler.start();
//!
//! let handle = scheduler.push(
//!     || async { Ok::<_, permafrost_core::TransferError>(42) },
//!     JobOptions::new(Category::Other).reference("example"),
//! )?;
//! assert_eq!(handle.await?, 42);
//!
//! scheduler.stop().await;
//! # Ok(())
//! # }
//! ```

use futures_util::future::{BoxFuture, try_join_all};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::slots::{Category, ConcurrencySlots};

/// Scheduler-assigned job identifier
pub type JobId = u64;

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not accepting work
    Pending,
    /// Accepting and running work
    Processing,
}

/// Category and cancellation reference for a pushed job
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Slot category
    pub category: Category,
    /// Grouping key used by [`Scheduler::remove`]
    pub reference: Option<String>,
}

impl JobOptions {
    /// Options for `category` with no reference
    #[must_use]
    pub fn new(category: Category) -> Self {
        Self {
            category,
            reference: None,
        }
    }

    /// Attach a cancellation reference
    #[must_use]
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// What [`Scheduler::remove`] should cancel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A single job
    Job(JobId),
    /// Every job pushed with this reference
    Reference(String),
}

impl From<JobId> for Target {
    fn from(id: JobId) -> Self {
        Target::Job(id)
    }
}

impl From<&str> for Target {
    fn from(reference: &str) -> Self {
        Target::Reference(reference.to_string())
    }
}

impl From<String> for Target {
    fn from(reference: String) -> Self {
        Target::Reference(reference)
    }
}

impl Target {
    fn matches(&self, id: JobId, reference: Option<&str>) -> bool {
        match self {
            Target::Job(target) => *target == id,
            Target::Reference(target) => reference == Some(target.as_str()),
        }
    }
}

/// Type-erased job body
trait Runnable: Send {
    /// Run with retries until success, a permanent failure or cancellation
    ///
    /// Consecutive attempts are at least `retry_delay` apart.
    fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        retry_limit: u32,
        retry_delay: Duration,
    ) -> BoxFuture<'static, ()>;

    /// Resolve as cancelled without running
    fn cancel(self: Box<Self>);
}

struct TypedJob<T, F> {
    id: JobId,
    handler: F,
    reply: oneshot::Sender<Result<T>>,
}

impl<T, F, Fut> Runnable for TypedJob<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        retry_limit: u32,
        retry_delay: Duration,
    ) -> BoxFuture<'static, ()> {
        let TypedJob {
            id,
            mut handler,
            reply,
        } = *self;

        Box::pin(async move {
            let mut attempt: u32 = 0;
            let outcome = loop {
                attempt += 1;
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(TransferError::Cancelled),
                    result = handler() => result,
                };

                match result {
                    Ok(value) => break Ok(value),
                    Err(err) if err.should_retry() && attempt <= retry_limit => {
                        tracing::warn!(job = id, attempt, "Job failed, retrying: {}", err);
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break Err(TransferError::Cancelled),
                            () = tokio::time::sleep(retry_delay) => {}
                        }
                    }
                    Err(err) => {
                        if !err.is_cancelled() {
                            tracing::debug!(job = id, attempt, "Job failed: {}", err);
                        }
                        break Err(err);
                    }
                }
            };

            // Receiver may have been dropped by a caller that lost interest
            let _ = reply.send(outcome);
        })
    }

    fn cancel(self: Box<Self>) {
        let _ = self.reply.send(Err(TransferError::Cancelled));
    }
}

struct QueuedJob {
    id: JobId,
    category: Category,
    reference: Option<String>,
    body: Box<dyn Runnable>,
}

struct RunningJob {
    reference: Option<String>,
    cancel: CancellationToken,
}

struct Shared {
    state: SchedulerState,
    queue: VecDeque<QueuedJob>,
    running: HashMap<JobId, RunningJob>,
    slots: ConcurrencySlots,
    ticker_active: bool,
}

struct Inner {
    tick: Duration,
    retry_limit: u32,
    next_id: AtomicU64,
    shared: Mutex<Shared>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        // Critical sections never panic, a poisoned lock still holds valid state
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Frees the job's slot when the running task ends, even on panic
struct SlotGuard {
    inner: Arc<Inner>,
    id: JobId,
    category: Category,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut shared = self.inner.lock();
        shared.running.remove(&self.id);
        shared.slots.remove(self.category);
    }
}

/// Result of a single pushed job
///
/// Resolves with the handler's value, its final error, or
/// [`TransferError::Cancelled`].
pub struct JobHandle<T> {
    id: JobId,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    /// Identifier usable with [`Scheduler::remove`]
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(TransferError::Channel("job dropped without a result".into()))
            })
        })
    }
}

/// Combined result of a batch push
///
/// Resolves with every value in submission order, or the first error.
pub struct BatchHandle<T> {
    ids: Vec<JobId>,
    inner: BoxFuture<'static, Result<Vec<T>>>,
}

impl<T> BatchHandle<T> {
    /// Identifiers of the jobs in the batch
    #[must_use]
    pub fn ids(&self) -> &[JobId] {
        &self.ids
    }
}

impl<T> Future for BatchHandle<T> {
    type Output = Result<Vec<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

/// Rate-limited job scheduler
///
/// Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler from transfer configuration
    #[must_use]
    pub fn new(config: &TransferConfig) -> Self {
        Self::with_settings(
            config.tick_interval(),
            config.retry_limit,
            config.maximum_active_parts,
        )
    }

    /// Create a scheduler with explicit tick, retry bound and part cap
    #[must_use]
    pub fn with_settings(tick: Duration, retry_limit: u32, maximum_active_parts: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                tick,
                retry_limit,
                next_id: AtomicU64::new(1),
                shared: Mutex::new(Shared {
                    state: SchedulerState::Pending,
                    queue: VecDeque::new(),
                    running: HashMap::new(),
                    slots: ConcurrencySlots::new(maximum_active_parts),
                    ticker_active: false,
                }),
            }),
        }
    }

    /// Start accepting work
    pub fn start(&self) {
        let mut shared = self.inner.lock();
        if shared.state != SchedulerState::Processing {
            shared.state = SchedulerState::Processing;
            tracing::debug!("Scheduler processing");
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    /// Interval between admissions
    #[must_use]
    pub fn tick(&self) -> Duration {
        self.inner.tick
    }

    /// True if anything is queued or running
    #[must_use]
    pub fn is_processing(&self) -> bool {
        let shared = self.inner.lock();
        !shared.queue.is_empty() || !shared.running.is_empty()
    }

    /// Jobs waiting for admission
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Jobs of `category` currently running
    #[must_use]
    pub fn running(&self, category: Category) -> usize {
        self.inner.lock().slots.get(category)
    }

    /// Enqueue one job
    ///
    /// The handler is invoked once per attempt. Transient failures are
    /// retried up to the configured bound; the category slot is held across
    /// retries.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::QueueNotReady`] if the scheduler is not
    /// processing.
    pub fn push<T, F, Fut>(&self, handler: F, options: JobOptions) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut shared = self.inner.lock();
        if shared.state != SchedulerState::Processing {
            return Err(TransferError::QueueNotReady);
        }

        let handle = self.enqueue(&mut shared, handler, options);
        self.ensure_ticker(&mut shared);
        Ok(handle)
    }

    /// Enqueue several jobs sharing one set of options
    ///
    /// Each job runs and retries independently; the returned handle resolves
    /// once all succeed or as soon as one fails.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::QueueNotReady`] if the scheduler is not
    /// processing, in which case nothing is enqueued.
    pub fn push_batch<T, F, Fut>(
        &self,
        handlers: Vec<F>,
        options: JobOptions,
    ) -> Result<BatchHandle<T>>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut shared = self.inner.lock();
        if shared.state != SchedulerState::Processing {
            return Err(TransferError::QueueNotReady);
        }

        let handles: Vec<JobHandle<T>> = handlers
            .into_iter()
            .map(|handler| self.enqueue(&mut shared, handler, options.clone()))
            .collect();
        self.ensure_ticker(&mut shared);

        Ok(BatchHandle {
            ids: handles.iter().map(JobHandle::id).collect(),
            inner: Box::pin(try_join_all(handles)),
        })
    }

    fn enqueue<T, F, Fut>(&self, shared: &mut Shared, handler: F, options: JobOptions) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();

        shared.queue.push_back(QueuedJob {
            id,
            category: options.category,
            reference: options.reference,
            body: Box::new(TypedJob { id, handler, reply }),
        });

        tracing::trace!(job = id, category = %options.category, "Job queued");
        JobHandle { id, receiver }
    }

    fn ensure_ticker(&self, shared: &mut Shared) {
        if shared.ticker_active {
            return;
        }
        shared.ticker_active = true;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let mut shared = inner.lock();
                if shared.queue.is_empty() {
                    shared.ticker_active = false;
                    break;
                }
                Self::admit_one(&inner, &mut shared);
            }
        });
    }

    /// Start the first queued job whose category has a free slot
    fn admit_one(inner: &Arc<Inner>, shared: &mut Shared) {
        let Some(position) = shared
            .queue
            .iter()
            .position(|job| shared.slots.available_slots(job.category) > 0)
        else {
            return;
        };
        let Some(job) = shared.queue.remove(position) else {
            return;
        };

        let cancel = CancellationToken::new();
        shared.slots.add(job.category);
        shared.running.insert(
            job.id,
            RunningJob {
                reference: job.reference,
                cancel: cancel.clone(),
            },
        );

        tracing::debug!(
            job = job.id,
            category = %job.category,
            in_flight = shared.slots.get(job.category),
            "Job admitted"
        );

        let guard = SlotGuard {
            inner: Arc::clone(inner),
            id: job.id,
            category: job.category,
        };
        let retry_limit = inner.retry_limit;
        let retry_delay = inner.tick;
        let body = job.body;
        tokio::spawn(async move {
            let _guard = guard;
            body.run(cancel, retry_limit, retry_delay).await;
        });
    }

    /// Cancel queued and running jobs matching `target`
    ///
    /// Queued jobs resolve as cancelled without running; running jobs are
    /// signalled and stop at their next suspension point. Resolves with the
    /// number of affected jobs once none of them is still in flight.
    pub async fn remove(&self, target: impl Into<Target>) -> usize {
        let target = target.into();
        let affected = {
            let mut shared = self.inner.lock();

            let mut dropped = Vec::new();
            let mut kept = VecDeque::with_capacity(shared.queue.len());
            for job in shared.queue.drain(..) {
                if target.matches(job.id, job.reference.as_deref()) {
                    dropped.push(job);
                } else {
                    kept.push_back(job);
                }
            }
            shared.queue = kept;

            let mut signalled = 0;
            for (id, running) in &shared.running {
                if target.matches(*id, running.reference.as_deref()) {
                    running.cancel.cancel();
                    signalled += 1;
                }
            }

            let count = dropped.len() + signalled;
            for job in dropped {
                job.body.cancel();
            }
            count
        };

        if affected > 0 {
            tracing::debug!(?target, affected, "Cancelling jobs");
        }

        loop {
            let in_flight = {
                let shared = self.inner.lock();
                shared
                    .running
                    .iter()
                    .any(|(id, running)| target.matches(*id, running.reference.as_deref()))
            };
            if !in_flight {
                break;
            }
            tokio::time::sleep(self.inner.tick).await;
        }

        affected
    }

    /// Stop accepting work, cancel everything and wait for the drain
    pub async fn stop(&self) {
        let dropped: Vec<QueuedJob> = {
            let mut shared = self.inner.lock();
            shared.state = SchedulerState::Pending;
            for running in shared.running.values() {
                running.cancel.cancel();
            }
            shared.queue.drain(..).collect()
        };

        let dropped_count = dropped.len();
        for job in dropped {
            job.body.cancel();
        }

        loop {
            let drained = {
                let shared = self.inner.lock();
                shared.running.is_empty() && shared.slots.is_empty()
            };
            if drained {
                break;
            }
            tokio::time::sleep(self.inner.tick).await;
        }

        tracing::info!(dropped = dropped_count, "Scheduler stopped");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("Scheduler")
            .field("state", &shared.state)
            .field("queued", &shared.queue.len())
            .field("running", &shared.running.len())
            .field("tick", &self.inner.tick)
            .finish()
    }
}
