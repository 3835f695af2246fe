use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::bus::{Delivery, EventBus};
use crate::error::{AppError, Stage};
use crate::models::{AttemptId, Event, Outcome, TopicKind};
use crate::traits::Scraper;

/// A key travelling through the ingress, with the acceptance handshake
/// that releases the caller of `Runner::add`.
pub(crate) struct Job {
    pub key: String,
    pub attempt: AttemptId,
    pub accepted: oneshot::Sender<()>,
}

/// Events emitted by workers for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Accepted {
        worker_id: &'a str,
        key: &'a str,
        attempt: AttemptId,
    },
    Withdrawn {
        worker_id: &'a str,
        key: &'a str,
        attempt: AttemptId,
    },
    RowsSkipped {
        worker_id: &'a str,
        key: &'a str,
        attempt: AttemptId,
        errors: &'a [AppError],
    },
    Published {
        worker_id: &'a str,
        key: &'a str,
        attempt: AttemptId,
        kind: TopicKind,
        delivery: Delivery,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl WorkerReporter for NullReporter {}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::debug!(%worker_id, "Worker started");
            }
            WorkerEvent::Accepted {
                worker_id,
                key,
                attempt,
            } => {
                tracing::debug!(%worker_id, %key, %attempt, "Key accepted");
            }
            WorkerEvent::Withdrawn {
                worker_id,
                key,
                attempt,
            } => {
                tracing::debug!(%worker_id, %key, %attempt, "Key withdrawn before acceptance");
            }
            WorkerEvent::RowsSkipped {
                worker_id,
                key,
                attempt,
                errors,
            } => {
                if let Some(first_error) = errors.first() {
                    tracing::warn!(
                        %worker_id,
                        %key,
                        %attempt,
                        skipped = errors.len(),
                        %first_error,
                        "Skipped rows that failed to normalize"
                    );
                }
            }
            WorkerEvent::Published {
                worker_id,
                key,
                attempt,
                kind,
                delivery,
            } => {
                if delivery.abandoned > 0 {
                    tracing::warn!(
                        %worker_id,
                        %key,
                        %attempt,
                        %kind,
                        delivered = delivery.delivered,
                        abandoned = delivery.abandoned,
                        "Outcome published, slow subscribers abandoned"
                    );
                } else {
                    tracing::debug!(
                        %worker_id,
                        %key,
                        %attempt,
                        %kind,
                        delivered = delivery.delivered,
                        "Outcome published"
                    );
                }
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::debug!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// What one attempt produced, before publication.
#[derive(Debug)]
pub struct AttemptReport<R> {
    pub outcome: Outcome<R>,
    /// Normalize errors for rows that were dropped.
    pub skipped: Vec<AppError>,
}

/// Run the capability for one key: fetch → extract → normalize.
///
/// Fetch and extract failures end the attempt; a row that fails to
/// normalize is dropped and the rest are kept in order.
pub async fn process<S: Scraper>(scraper: &S, key: &str) -> AttemptReport<S::Row> {
    let failure = |stage, error| AttemptReport {
        outcome: Outcome::Failure {
            cause: AppError::at_stage(stage, key, error),
        },
        skipped: Vec::new(),
    };

    let payload = match scraper.fetch(key).await {
        Ok(payload) => payload,
        Err(e) => return failure(Stage::Fetch, e),
    };

    let raw_rows = match scraper.extract(payload) {
        Ok(rows) => rows,
        Err(e) => return failure(Stage::Extract, e),
    };

    let mut rows = Vec::with_capacity(raw_rows.len());
    let mut skipped = Vec::new();
    for raw in raw_rows {
        match scraper.normalize(raw) {
            Ok(row) => rows.push(row),
            Err(e) => skipped.push(AppError::at_stage(Stage::Normalize, key, e)),
        }
    }

    AttemptReport {
        outcome: Outcome::Success { rows },
        skipped,
    }
}

/// One member of the pool. Drains the shared ingress until it is closed
/// and empty.
pub(crate) struct Worker<S: Scraper> {
    pub id: String,
    pub scraper: Arc<S>,
    pub bus: EventBus<S::Row>,
    pub ingress: Arc<Mutex<mpsc::Receiver<Job>>>,
    pub reporter: Arc<dyn WorkerReporter>,
}

impl<S: Scraper> Worker<S> {
    pub async fn run(self) {
        self.reporter.report(WorkerEvent::Started {
            worker_id: &self.id,
        });

        loop {
            let job = {
                let mut ingress = self.ingress.lock().await;
                ingress.recv().await
            };
            let Some(job) = job else {
                break;
            };

            // A caller that stopped waiting has withdrawn the key.
            if job.accepted.send(()).is_err() {
                self.reporter.report(WorkerEvent::Withdrawn {
                    worker_id: &self.id,
                    key: &job.key,
                    attempt: job.attempt,
                });
                continue;
            }
            self.reporter.report(WorkerEvent::Accepted {
                worker_id: &self.id,
                key: &job.key,
                attempt: job.attempt,
            });

            let report = AssertUnwindSafe(process(self.scraper.as_ref(), &job.key))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| AttemptReport {
                    outcome: Outcome::Failure {
                        cause: AppError::Panicked {
                            key: job.key.clone(),
                            message: panic_message(panic.as_ref()),
                        },
                    },
                    skipped: Vec::new(),
                });

            if !report.skipped.is_empty() {
                self.reporter.report(WorkerEvent::RowsSkipped {
                    worker_id: &self.id,
                    key: &job.key,
                    attempt: job.attempt,
                    errors: &report.skipped,
                });
            }

            let kind = report.outcome.kind();
            let event = Event::new(job.key, job.attempt, report.outcome);
            let topic = event.topic();
            let delivery = self.bus.publish(&topic, event).await;

            self.reporter.report(WorkerEvent::Published {
                worker_id: &self.id,
                key: &topic.key,
                attempt: job.attempt,
                kind,
                delivery,
            });
        }

        self.reporter.report(WorkerEvent::Stopped {
            worker_id: &self.id,
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
