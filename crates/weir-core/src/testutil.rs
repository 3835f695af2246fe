//! Test utilities: a scripted capability and a recording reporter.
//!
//! Handwritten mocks for dependency injection in unit and integration
//! tests. All shared state lives behind `Arc`, so a clone kept by the test
//! observes the calls made by the runner's workers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::AppError;
use crate::traits::Scraper;
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockScraper
// ---------------------------------------------------------------------------

/// Payload produced by [`MockScraper::fetch`].
#[derive(Debug, Clone)]
pub struct MockPayload {
    pub key: String,
    pub rows: Vec<String>,
}

/// Scripted capability.
///
/// - fetch returns the rows registered for the key, or `[key]` by default
/// - extract hands those rows back unchanged
/// - normalize uppercases a row, failing for rows starting with `bad`
#[derive(Clone, Default)]
pub struct MockScraper {
    rows: Arc<Mutex<HashMap<String, Vec<String>>>>,
    fetch_errors: Arc<Mutex<HashMap<String, AppError>>>,
    extract_errors: Arc<Mutex<HashMap<String, AppError>>>,
    delays: Arc<Mutex<HashMap<String, Duration>>>,
    panics: Arc<Mutex<HashSet<String>>>,
    default_delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    pub fetch_calls: Arc<Mutex<Vec<String>>>,
    extract_calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockScraper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, key: &str, rows: &[&str]) -> Self {
        self.rows.lock().unwrap().insert(
            key.to_string(),
            rows.iter().map(|r| r.to_string()).collect(),
        );
        self
    }

    pub fn with_fetch_error(self, key: &str, error: AppError) -> Self {
        self.fetch_errors
            .lock()
            .unwrap()
            .insert(key.to_string(), error);
        self
    }

    pub fn with_extract_error(self, key: &str, error: AppError) -> Self {
        self.extract_errors
            .lock()
            .unwrap()
            .insert(key.to_string(), error);
        self
    }

    /// Delay fetches of one key.
    pub fn with_delay(self, key: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(key.to_string(), delay);
        self
    }

    /// Delay every fetch without a key-specific delay.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    /// Panic while fetching `key`.
    pub fn with_panic(self, key: &str) -> Self {
        self.panics.lock().unwrap().insert(key.to_string());
        self
    }

    /// Make every fetch wait for a permit on the returned semaphore.
    ///
    /// The semaphore starts with no permits; each `add_permits(1)` lets one
    /// fetch through.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetch_calls.lock().unwrap().clone()
    }

    pub fn extract_calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Scraper for MockScraper {
    type Payload = MockPayload;
    type RawRow = String;
    type Row = String;

    async fn fetch(&self, key: &str) -> Result<MockPayload, AppError> {
        self.fetch_calls.lock().unwrap().push(key.to_string());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .or(self.default_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panics.lock().unwrap().contains(key) {
            panic!("scripted panic for {key}");
        }
        if let Some(error) = self.fetch_errors.lock().unwrap().get(key).cloned() {
            return Err(error);
        }

        let rows = self
            .rows
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| vec![key.to_string()]);
        Ok(MockPayload {
            key: key.to_string(),
            rows,
        })
    }

    fn extract(&self, payload: MockPayload) -> Result<Vec<String>, AppError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.extract_errors.lock().unwrap().get(&payload.key).cloned() {
            return Err(error);
        }
        Ok(payload.rows)
    }

    fn normalize(&self, row: String) -> Result<String, AppError> {
        if row.starts_with("bad") {
            return Err(AppError::Generic(format!("malformed row '{row}'")));
        }
        Ok(row.to_uppercase())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records events.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.as_str() == label)
            .count()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Accepted { .. } => "Accepted",
            WorkerEvent::Withdrawn { .. } => "Withdrawn",
            WorkerEvent::RowsSkipped { .. } => "RowsSkipped",
            WorkerEvent::Published { .. } => "Published",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}
