use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Weir.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// The capability could not fetch the payload for a key.
    #[error("Fetch error for {key}: {message}")]
    Fetch { key: String, message: String },

    /// The payload could not be decomposed into rows.
    #[error("Extract error for {key}: {message}")]
    Extract { key: String, message: String },

    /// A single row could not be normalized. Recoverable: the row is skipped.
    #[error("Normalize error for {key}: {message}")]
    Normalize { key: String, message: String },

    /// The capability panicked while processing a key.
    #[error("Capability panicked on {key}: {message}")]
    Panicked { key: String, message: String },

    /// `add` was called after the runner was closed.
    #[error("Work queue is closed")]
    ClosedQueue,

    /// The attempt succeeded but produced no rows.
    #[error("No rows produced for {key}")]
    NoRows { key: String },

    /// A blocking wait hit its deadline.
    #[error("Wait timed out after {0:?}")]
    WaitTimeout(Duration),

    /// The bus went away before a subscription received anything.
    #[error("Subscription closed before an outcome arrived")]
    SubscriptionClosed,

    /// Invalid runner configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error, typically raised by a capability implementation.
    #[error("{0}")]
    Generic(String),
}

/// Processing stage of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Extract,
    Normalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetch => write!(f, "fetch"),
            Stage::Extract => write!(f, "extract"),
            Stage::Normalize => write!(f, "normalize"),
        }
    }
}

impl AppError {
    /// Reclassify a capability error as a failure of `stage` for `key`.
    ///
    /// Errors that already carry the matching stage are passed through.
    pub fn at_stage(stage: Stage, key: &str, error: AppError) -> Self {
        if error.stage() == Some(stage) {
            return error;
        }
        let key = key.to_string();
        let message = error.to_string();
        match stage {
            Stage::Fetch => AppError::Fetch { key, message },
            Stage::Extract => AppError::Extract { key, message },
            Stage::Normalize => AppError::Normalize { key, message },
        }
    }

    /// The processing stage this error belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            AppError::Fetch { .. } => Some(Stage::Fetch),
            AppError::Extract { .. } => Some(Stage::Extract),
            AppError::Normalize { .. } => Some(Stage::Normalize),
            _ => None,
        }
    }

    /// Returns true if this error ends the attempt it occurred in.
    ///
    /// Normalize errors only drop the offending row.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AppError::Normalize { .. })
    }
}
