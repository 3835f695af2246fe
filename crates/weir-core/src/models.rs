use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::error::AppError;

/// Identifier assigned to one processing attempt by `Runner::add`.
///
/// Repeated adds of the same key get distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome<R> {
    /// Fetch and extract succeeded; rows that normalized, in extraction order.
    Success { rows: Vec<R> },
    /// Fetch or extract failed.
    Failure {
        #[serde(serialize_with = "serialize_error")]
        cause: AppError,
    },
}

impl<R> Outcome<R> {
    /// The topic kind this outcome is published on.
    pub fn kind(&self) -> TopicKind {
        match self {
            Outcome::Success { .. } => TopicKind::Result,
            Outcome::Failure { .. } => TopicKind::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn into_result(self) -> Result<Vec<R>, AppError> {
        match self {
            Outcome::Success { rows } => Ok(rows),
            Outcome::Failure { cause } => Err(cause),
        }
    }
}

fn serialize_error<S: Serializer>(error: &AppError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// An outcome bound to the key and attempt that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event<R> {
    pub key: String,
    pub attempt: AttemptId,
    pub outcome: Outcome<R>,
    pub finished_at: DateTime<Utc>,
}

impl<R> Event<R> {
    pub fn new(key: impl Into<String>, attempt: AttemptId, outcome: Outcome<R>) -> Self {
        Self {
            key: key.into(),
            attempt,
            outcome,
            finished_at: Utc::now(),
        }
    }

    /// The topic this event belongs on.
    pub fn topic(&self) -> Topic {
        Topic::new(self.key.clone(), self.outcome.kind())
    }
}

/// Which of a key's two derived topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Result,
    Error,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Result => "result",
            TopicKind::Error => "error",
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A pub/sub channel scoped to one key and one outcome kind.
///
/// Matching is on the `(key, kind)` pair, never on the rendered name, so
/// keys that contain `:` cannot collide with another key's topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub key: String,
    pub kind: TopicKind,
}

impl Topic {
    pub fn new(key: impl Into<String>, kind: TopicKind) -> Self {
        Self {
            key: key.into(),
            kind,
        }
    }

    pub fn result(key: impl Into<String>) -> Self {
        Self::new(key, TopicKind::Result)
    }

    pub fn error(key: impl Into<String>) -> Self {
        Self::new(key, TopicKind::Error)
    }

    /// Both topics of a key, result first.
    pub fn both(key: &str) -> [Topic; 2] {
        [Topic::result(key), Topic::error(key)]
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.kind)
    }
}
