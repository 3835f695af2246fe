use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bus::{EventBus, Once, Subscription};
use crate::config::RunnerConfig;
use crate::error::AppError;
use crate::models::{AttemptId, Event, Topic};
use crate::traits::Scraper;
use crate::waiter::ResultWaiter;
use crate::worker::{Job, NullReporter, Worker, WorkerReporter};

/// Runs a stream of work keys through a [`Scraper`] on a bounded worker
/// pool and publishes each attempt's outcome on the runner's [`EventBus`].
///
/// ```text
/// add(key) ──▶ ingress (rendezvous) ──▶ worker × N ──▶ fetch → extract → normalize
///                                                           │
///                          subscribers ◀── EventBus ◀───────┘  key:result | key:error
/// ```
///
/// Outcomes are not buffered: subscribe (or create a [`ResultWaiter`])
/// before adding the key, or use [`submit`](Self::submit) which does both.
pub struct Runner<S: Scraper> {
    config: RunnerConfig,
    bus: EventBus<S::Row>,
    ingress: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_attempt: AtomicU64,
}

impl<S: Scraper> Runner<S> {
    /// Start a runner with silent workers.
    ///
    /// Must be called from within a Tokio runtime. Pass a
    /// [`TracingWorkerReporter`](crate::worker::TracingWorkerReporter) to
    /// [`with_reporter`](Self::with_reporter) for per-attempt logs.
    pub fn new(scraper: S, config: RunnerConfig) -> Result<Self, AppError> {
        Self::with_reporter(scraper, config, NullReporter)
    }

    pub fn with_reporter<WR>(
        scraper: S,
        config: RunnerConfig,
        reporter: WR,
    ) -> Result<Self, AppError>
    where
        WR: WorkerReporter + 'static,
    {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| {
            AppError::Config("Runner must be started within a Tokio runtime".into())
        })?;

        let bus = EventBus::from_config(&config);
        // Capacity 1 is the smallest tokio allows; `add` still waits for the
        // worker's acknowledgement, so a buffered key is never "accepted".
        let (sender, receiver) = mpsc::channel(1);
        let ingress = Arc::new(tokio::sync::Mutex::new(receiver));
        let scraper = Arc::new(scraper);
        let reporter: Arc<dyn WorkerReporter> = Arc::new(reporter);

        let workers = (1..=config.worker_count)
            .map(|n| {
                let worker = Worker {
                    id: format!("worker-{n}"),
                    scraper: Arc::clone(&scraper),
                    bus: bus.clone(),
                    ingress: Arc::clone(&ingress),
                    reporter: Arc::clone(&reporter),
                };
                handle.spawn(worker.run())
            })
            .collect();

        tracing::info!(
            workers = config.worker_count,
            grace_ms = config.publish_grace.as_millis() as u64,
            "Runner started"
        );

        Ok(Self {
            config,
            bus,
            ingress: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            next_attempt: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The bus outcomes are published on.
    pub fn bus(&self) -> &EventBus<S::Row> {
        &self.bus
    }

    fn lock_ingress(&self) -> MutexGuard<'_, Option<mpsc::Sender<Job>>> {
        self.ingress.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned ingress mutex");
            poisoned.into_inner()
        })
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.lock_ingress().is_none()
    }

    /// Enqueue `key` and wait until a worker has accepted it.
    ///
    /// Every call is an independent attempt, even for a key already in
    /// flight. Fails with [`AppError::ClosedQueue`] once the runner is closed.
    ///
    /// Dropping the returned future before a worker accepts the key
    /// withdraws it: the attempt never runs and nothing is published.
    pub async fn add(&self, key: impl Into<String>) -> Result<AttemptId, AppError> {
        let attempt = self.reserve_attempt();
        self.enqueue(key.into(), attempt).await?;
        Ok(attempt)
    }

    fn reserve_attempt(&self) -> AttemptId {
        AttemptId(self.next_attempt.fetch_add(1, Ordering::Relaxed))
    }

    async fn enqueue(&self, key: String, attempt: AttemptId) -> Result<(), AppError> {
        let sender = self.lock_ingress().clone().ok_or(AppError::ClosedQueue)?;
        let (accepted, acknowledged) = oneshot::channel();

        sender
            .send(Job {
                key,
                attempt,
                accepted,
            })
            .await
            .map_err(|_| AppError::ClosedQueue)?;
        drop(sender);

        acknowledged.await.map_err(|_| AppError::ClosedQueue)
    }

    /// Add `key` with a [`ResultWaiter`] bound to this attempt.
    ///
    /// Unlike [`wait_result`](Self::wait_result), the waiter only resolves
    /// with the outcome of the attempt started here, so concurrent submits
    /// of one key each get their own outcome.
    pub async fn submit(&self, key: impl Into<String>) -> Result<ResultWaiter<S::Row>, AppError> {
        let key = key.into();
        let attempt = self.reserve_attempt();
        let once = self.bus.subscribe_attempt(Topic::both(&key), attempt);
        let waiter = ResultWaiter::new(key.clone(), once);
        self.enqueue(key, attempt).await?;
        Ok(waiter)
    }

    /// Repeatable subscription to both topics of `key`.
    pub fn subscribe(&self, key: &str) -> Subscription<S::Row> {
        self.bus.subscribe(Topic::both(key))
    }

    /// Repeatable subscription to `key:result` only.
    pub fn subscribe_results(&self, key: &str) -> Subscription<S::Row> {
        self.bus.subscribe([Topic::result(key)])
    }

    /// Repeatable subscription to `key:error` only.
    pub fn subscribe_errors(&self, key: &str) -> Subscription<S::Row> {
        self.bus.subscribe([Topic::error(key)])
    }

    /// One-shot subscription to the next event on either topic of `key`.
    ///
    /// Every one-shot registered when an event is published receives it.
    pub fn subscribe_once(&self, key: &str) -> Once<S::Row> {
        self.bus.subscribe_once(Topic::both(key))
    }

    /// Register a single-row waiter for `key` without waiting yet.
    pub fn wait_result(&self, key: &str) -> ResultWaiter<S::Row> {
        ResultWaiter::new(key, self.subscribe_once(key))
    }

    /// Wait for the next outcome of `key` as a single row.
    ///
    /// The waiter is registered when this future is first polled.
    pub async fn one_result(&self, key: &str) -> Result<S::Row, AppError> {
        self.wait_result(key).recv().await
    }

    /// [`one_result`](Self::one_result) with a deadline.
    pub async fn one_result_timeout(
        &self,
        key: &str,
        deadline: Duration,
    ) -> Result<S::Row, AppError> {
        self.wait_result(key).recv_timeout(deadline).await
    }

    /// Wait for the next full event of `key`, keeping every row.
    pub async fn one_outcome(&self, key: &str) -> Result<Event<S::Row>, AppError> {
        self.subscribe_once(key).recv().await
    }

    /// Close the ingress. In-flight attempts still publish; workers exit
    /// once the ingress is drained.
    ///
    /// Idempotent: returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let closed = self.lock_ingress().take().is_some();
        if closed {
            tracing::info!("Work queue closed");
        }
        closed
    }

    /// Close the ingress and wait for every worker to exit.
    pub async fn shutdown(&self) {
        self.close();
        let workers = std::mem::take(&mut *self.lock_workers());
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
        tracing::info!("Runner stopped");
    }
}
