use std::future::Future;

use crate::error::AppError;

/// Pluggable fetch → extract → normalize capability run by every worker.
///
/// Implementations are stateless from the runner's point of view: one
/// instance is shared by all workers and each stage may fail on its own.
/// Errors returned from a stage are reclassified to that stage by the
/// worker (see [`AppError::at_stage`]).
pub trait Scraper: Send + Sync + 'static {
    /// Raw payload returned by `fetch` (e.g. an HTML document).
    type Payload: Send;
    /// One undecoded row extracted from a payload.
    type RawRow: Send;
    /// A normalized row, fanned out to subscribers.
    type Row: Clone + Send + Sync + 'static;

    /// Retrieves the payload for a work key.
    fn fetch(&self, key: &str) -> impl Future<Output = Result<Self::Payload, AppError>> + Send;

    /// Splits a payload into raw rows. Failure is fatal for the attempt.
    fn extract(&self, payload: Self::Payload) -> Result<Vec<Self::RawRow>, AppError>;

    /// Normalizes one raw row. Failure only drops that row.
    fn normalize(&self, row: Self::RawRow) -> Result<Self::Row, AppError>;
}
