use std::time::Duration;

use crate::error::AppError;

/// Default grace period a publish waits on one slow subscriber.
pub const DEFAULT_PUBLISH_GRACE: Duration = Duration::from_millis(5);

/// Default per-subscription buffer for repeatable subscriptions.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1;

/// Configuration for a [`Runner`](crate::runner::Runner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Number of workers draining the ingress.
    pub worker_count: usize,
    /// Longest a publish waits for a single repeatable subscriber.
    pub publish_grace: Duration,
    /// Buffered events per repeatable subscription.
    pub subscriber_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            publish_grace: DEFAULT_PUBLISH_GRACE,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// Available parallelism minus one, floor 1.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl RunnerConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_publish_grace(mut self, grace: Duration) -> Self {
        self.publish_grace = grace;
        self
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    /// Read configuration from environment variables.
    ///
    /// - `WEIR_WORKERS` (optional, defaults to parallelism - 1)
    /// - `WEIR_PUBLISH_GRACE_MS` (optional, defaults to 5)
    /// - `WEIR_SUBSCRIBER_CAPACITY` (optional, defaults to 1)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();

        let worker_count = match lookup("WEIR_WORKERS") {
            None => defaults.worker_count,
            Some(raw) => parse_positive("WEIR_WORKERS", &raw)?,
        };

        let publish_grace = match lookup("WEIR_PUBLISH_GRACE_MS") {
            None => defaults.publish_grace,
            Some(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|_| {
                    AppError::Config(format!(
                        "Invalid WEIR_PUBLISH_GRACE_MS '{raw}': must be a non-negative integer"
                    ))
                })?;
                Duration::from_millis(ms)
            }
        };

        let subscriber_capacity = match lookup("WEIR_SUBSCRIBER_CAPACITY") {
            None => defaults.subscriber_capacity,
            Some(raw) => parse_positive("WEIR_SUBSCRIBER_CAPACITY", &raw)?,
        };

        let config = Self {
            worker_count,
            publish_grace,
            subscriber_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the runner cannot operate with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.worker_count == 0 {
            return Err(AppError::Config("worker_count must be at least 1".into()));
        }
        if self.subscriber_capacity == 0 {
            return Err(AppError::Config(
                "subscriber_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<usize, AppError> {
    let parsed: usize = raw.trim().parse().map_err(|_| {
        AppError::Config(format!(
            "Invalid {name} '{raw}': must be a positive integer"
        ))
    })?;
    if parsed == 0 {
        return Err(AppError::Config(format!("{name} must be at least 1")));
    }
    Ok(parsed)
}
