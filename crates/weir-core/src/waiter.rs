use std::time::Duration;

use crate::bus::Once;
use crate::error::AppError;
use crate::models::{AttemptId, Event, Outcome};

/// Waits for the next outcome of a key on either of its topics and
/// resolves it to a single row.
///
/// Row policy: a success with no rows is [`AppError::NoRows`]; otherwise
/// the first row is returned and the rest are discarded. Use
/// [`recv_event`](Self::recv_event) to keep every row.
///
/// The waiter is registered on construction, so creating it before the
/// key is added guarantees it cannot miss the outcome.
pub struct ResultWaiter<R> {
    key: String,
    once: Once<R>,
}

impl<R> ResultWaiter<R> {
    pub(crate) fn new(key: impl Into<String>, once: Once<R>) -> Self {
        Self {
            key: key.into(),
            once,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The attempt this waiter is bound to, when created by `Runner::submit`.
    pub fn attempt(&self) -> Option<AttemptId> {
        self.once.attempt()
    }

    pub async fn recv(self) -> Result<R, AppError> {
        first_row(self.once.recv().await?)
    }

    pub async fn recv_timeout(self, deadline: Duration) -> Result<R, AppError> {
        first_row(self.once.recv_timeout(deadline).await?)
    }

    /// Blocking variant of [`recv`](Self::recv) for non-async threads.
    pub fn blocking_recv(self) -> Result<R, AppError> {
        first_row(self.once.blocking_recv()?)
    }

    /// The whole event, with every row and the attempt id.
    pub async fn recv_event(self) -> Result<Event<R>, AppError> {
        self.once.recv().await
    }
}

fn first_row<R>(event: Event<R>) -> Result<R, AppError> {
    match event.outcome {
        Outcome::Success { rows } => rows
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NoRows { key: event.key }),
        Outcome::Failure { cause } => Err(cause),
    }
}
