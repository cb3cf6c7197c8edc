//! Concurrency controller.
//!
//! Every expensive call passes through here:
//! - admission against `workers + queue_depth` in-flight units, or `Overloaded`
//! - a per-class token bucket
//! - a worker permit from a fixed-size pool
//! - a deadline and the caller's cancel token
//!
//! The unit of work receives its own [`CancelToken`]. It is cancelled when the
//! deadline passes, when the caller cancels or when the caller drops the call,
//! so a store write still in flight rolls back instead of committing.
//!
//! The worker permit is held through a [`WorkLease`]. Store calls the unit
//! started keep it until their blocking task returns, so a timed-out or
//! abandoned unit does not free its worker while SQLite is still working.

mod job;
mod limiter;

pub use job::{JobCounters, JobId, JobRecord, JobState, JobTracker};
pub use limiter::ClassLimiters;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use mnemo_core::{CancelToken, ErrorKind, WorkLease};

use crate::config::ControllerConfig;
use crate::{SDKError, SDKResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Search,
    Write,
    Consolidate,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Write => "write",
            Self::Consolidate => "consolidate",
        }
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call deadline and cancellation.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Falls back to `controller.default_timeout_ms`.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ControllerStats {
    pub workers: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub available_workers: usize,
    pub jobs: JobCounters,
}

struct Inner {
    workers: Arc<Semaphore>,
    worker_count: usize,
    queue_depth: usize,
    in_flight: AtomicUsize,
    limiters: ClassLimiters,
    tracker: JobTracker,
    default_timeout: Duration,
}

/// An admitted unit. Releases its slot on drop; a ticket dropped before it
/// settles marks the job cancelled and cancels the unit.
struct Ticket {
    inner: Arc<Inner>,
    job_id: JobId,
    class: OperationClass,
    token: CancelToken,
    settled: bool,
}

impl Ticket {
    fn settle<T>(&mut self, result: &SDKResult<T>, elapsed: Duration) {
        let next = match result {
            Ok(_) => JobState::Completed,
            Err(e) if matches!(e.kind(), ErrorKind::Timeout | ErrorKind::Cancelled) => JobState::Cancelled,
            Err(_) => JobState::Failed,
        };
        // A unit that never got a worker can only end cancelled.
        let next = match self.inner.tracker.state(self.job_id) {
            Some(JobState::Queued) => JobState::Cancelled,
            _ => next,
        };
        if next == JobState::Cancelled {
            self.token.cancel();
        }
        if let Err(e) = self.inner.tracker.transition(self.job_id, next) {
            tracing::debug!(job_id = %self.job_id, error = %e, "Job state not updated");
        }
        self.settled = true;

        tracing::debug!(
            job_id = %self.job_id,
            class = %self.class,
            state = %next,
            duration_ms = elapsed.as_millis() as u64,
            "Job finished"
        );
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.settled {
            self.token.cancel();
            let _ = self.inner.tracker.transition(self.job_id, JobState::Cancelled);
            tracing::debug!(job_id = %self.job_id, class = %self.class, "Job abandoned by its caller");
        }
    }
}

async fn cancelled(token: Option<&CancelToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn execute<F, Fut, T>(
    mut ticket: Ticket,
    timeout: Duration,
    caller: Option<CancelToken>,
    work: F,
) -> SDKResult<T>
where
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = SDKResult<T>>,
{
    let start = Instant::now();
    let inner = ticket.inner.clone();
    let token = ticket.token.clone();
    let (job_id, class) = (ticket.job_id, ticket.class);

    let unit = async {
        inner.limiters.until_ready(class).await;
        let permit = inner
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SDKError::invalid_operation("controller is shut down"))?;
        inner.tracker.transition(job_id, JobState::Running)?;
        WorkLease::new(permit).scope(work(token.clone())).await
    };

    let result = tokio::select! {
        biased;
        _ = cancelled(caller.as_ref()) => Err(SDKError::Cancelled),
        outcome = tokio::time::timeout(timeout, unit) => {
            outcome.unwrap_or_else(|_| Err(SDKError::timeout(timeout.as_millis() as u64)))
        }
    };

    ticket.settle(&result, start.elapsed());
    result
}

/// Handle to a unit started with [`ConcurrencyController::spawn`].
pub struct JobHandle<T> {
    id: JobId,
    cancel: CancelToken,
    inner: Arc<Inner>,
    join: JoinHandle<SDKResult<T>>,
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Request cancellation; a queued job never starts, a running one rolls back.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> Option<JobState> {
        self.inner.tracker.state(self.id)
    }

    pub async fn join(self) -> SDKResult<T> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(mnemo_core::Error::from(e).into()),
        }
    }
}

/// Bounded worker pool with per-class rate limits and backpressure.
#[derive(Clone)]
pub struct ConcurrencyController {
    inner: Arc<Inner>,
}

impl ConcurrencyController {
    pub fn new(config: &ControllerConfig) -> SDKResult<Self> {
        if config.workers == 0 {
            return Err(SDKError::invalid_operation("controller.workers must be greater than 0"));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                workers: Arc::new(Semaphore::new(config.workers)),
                worker_count: config.workers,
                queue_depth: config.queue_depth,
                in_flight: AtomicUsize::new(0),
                limiters: ClassLimiters::new(config)?,
                tracker: JobTracker::new(),
                default_timeout: Duration::from_millis(config.default_timeout_ms),
            }),
        })
    }

    fn timeout_for(&self, options: &CallOptions) -> Duration {
        options.timeout.unwrap_or(self.inner.default_timeout)
    }

    fn admit(&self, class: OperationClass) -> SDKResult<Ticket> {
        let capacity = self.inner.worker_count + self.inner.queue_depth;
        let previous = self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        if previous >= capacity {
            self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.tracker.reject();
            tracing::warn!(class = %class, in_flight = previous, "Controller overloaded, rejecting unit");
            return Err(SDKError::overloaded(class.as_str(), self.inner.queue_depth));
        }

        Ok(Ticket {
            inner: self.inner.clone(),
            job_id: self.inner.tracker.register(class),
            class,
            token: CancelToken::new(),
            settled: false,
        })
    }

    /// Run one unit of work inline and wait for it.
    pub async fn run<F, Fut, T>(&self, class: OperationClass, options: &CallOptions, work: F) -> SDKResult<T>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = SDKResult<T>>,
    {
        let ticket = self.admit(class)?;
        execute(ticket, self.timeout_for(options), options.cancel.clone(), work).await
    }

    /// Start a unit on its own task.
    ///
    /// Admission is decided before this returns, so `Overloaded` is reported
    /// here rather than from [`JobHandle::join`].
    pub fn spawn<F, Fut, T>(&self, class: OperationClass, options: CallOptions, work: F) -> SDKResult<JobHandle<T>>
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = SDKResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let ticket = self.admit(class)?;
        let id = ticket.job_id;
        let timeout = self.timeout_for(&options);
        let cancel = options.cancel.unwrap_or_default();
        let caller = cancel.clone();

        let join = tokio::spawn(async move { execute(ticket, timeout, Some(caller), work).await });
        tracing::debug!(job_id = %id, class = %class, "Job spawned");

        Ok(JobHandle {
            id,
            cancel,
            inner: self.inner.clone(),
            join,
        })
    }

    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        self.inner.tracker.state(id)
    }

    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.inner.tracker.get(id)
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            workers: self.inner.worker_count,
            queue_depth: self.inner.queue_depth,
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            available_workers: self.inner.workers.available_permits(),
            jobs: self.inner.tracker.counters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tiers::test_support::open_store;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::oneshot;

    fn controller(workers: usize, queue_depth: usize) -> ConcurrencyController {
        ConcurrencyController::new(&ControllerConfig {
            workers,
            queue_depth,
            ..Default::default()
        })
        .unwrap()
    }

    async fn wait_for_state(controller: &ConcurrencyController, id: JobId, state: JobState) {
        for _ in 0..200 {
            if controller.job_state(id) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never reached {}", id, state);
    }

    #[tokio::test]
    async fn test_run_completes() {
        let controller = controller(2, 2);
        let value = controller
            .run(OperationClass::Search, &CallOptions::default(), |_| async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let stats = controller.stats();
        assert_eq!(stats.jobs.completed, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.available_workers, 2);
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let controller = controller(2, 2);
        let err = controller
            .run(OperationClass::Write, &CallOptions::default(), |_| async {
                Err::<(), _>(SDKError::invalid_operation("nope"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert_eq!(controller.stats().jobs.failed, 1);
    }

    #[tokio::test]
    async fn test_overloaded_beyond_queue_depth() {
        let controller = controller(1, 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = controller
            .spawn(OperationClass::Write, CallOptions::default(), |_| async move {
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();
        wait_for_state(&controller, running.id(), JobState::Running).await;

        let queued = controller
            .spawn(OperationClass::Write, CallOptions::default(), |_| async { Ok(()) })
            .unwrap();
        assert_eq!(queued.state(), Some(JobState::Queued));

        let err = controller
            .run(OperationClass::Write, &CallOptions::default(), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overloaded);
        assert!(err.is_retryable());
        assert_eq!(controller.stats().jobs.rejected, 1);

        release_tx.send(()).unwrap();
        running.join().await.unwrap();
        queued.join().await.unwrap();
        assert_eq!(controller.stats().jobs.completed, 2);
        assert_eq!(controller.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let controller = controller(1, 4);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = controller
            .spawn(OperationClass::Consolidate, CallOptions::default(), |_| async move {
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();
        wait_for_state(&controller, running.id(), JobState::Running).await;

        let queued = controller
            .spawn(OperationClass::Consolidate, CallOptions::default(), |_| async { Ok(()) })
            .unwrap();
        let queued_id = queued.id();
        queued.cancel();
        let err = queued.join().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(controller.job_state(queued_id), Some(JobState::Cancelled));

        release_tx.send(()).unwrap();
        running.join().await.unwrap();
        assert_eq!(controller.job_state(queued_id), Some(JobState::Cancelled));
    }

    #[tokio::test]
    async fn test_timeout_cancels_unit_token() {
        let controller = controller(2, 2);
        let (token_tx, token_rx) = oneshot::channel::<CancelToken>();

        let options = CallOptions::default().with_timeout(Duration::from_millis(50));
        let err = controller
            .run(OperationClass::Write, &options, |token| async move {
                let _ = token_tx.send(token);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(token_rx.await.unwrap().is_cancelled());
        assert_eq!(controller.stats().jobs.cancelled, 1);
    }

    #[tokio::test]
    async fn test_timed_out_store_call_keeps_its_worker() {
        let (_dir, store) = open_store().await;
        let controller = controller(1, 4);
        let finished = Arc::new(AtomicBool::new(false));

        let options = CallOptions::default().with_timeout(Duration::from_millis(50));
        let err = controller
            .run(OperationClass::Search, &options, |_| {
                let store = store.clone();
                let finished = finished.clone();
                async move {
                    store
                        .read(move |_| {
                            std::thread::sleep(Duration::from_millis(300));
                            finished.store(true, Ordering::SeqCst);
                            Ok(())
                        })
                        .await?;
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(controller.stats().available_workers, 0);

        // The next unit only gets the worker once the read has returned.
        let saw_finished = controller
            .run(OperationClass::Search, &CallOptions::default(), |_| {
                let finished = finished.clone();
                async move { Ok(finished.load(Ordering::SeqCst)) }
            })
            .await
            .unwrap();
        assert!(saw_finished);
        assert_eq!(controller.stats().available_workers, 1);
    }

    #[tokio::test]
    async fn test_caller_cancel_while_running() {
        let controller = controller(2, 2);
        let caller = CancelToken::new();
        let options = CallOptions::default().with_cancel(caller.clone());

        let canceller = {
            let caller = caller.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                caller.cancel();
            })
        };

        let err = controller
            .run(OperationClass::Search, &options, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(controller.stats().jobs.cancelled, 1);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(ConcurrencyController::new(&config).is_err());
    }
}
