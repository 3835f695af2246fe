pub mod bus;
pub mod config;
pub mod error;
pub mod models;
pub mod runner;
pub mod testutil;
pub mod traits;
pub mod waiter;
pub mod worker;

pub use bus::{Delivery, EventBus, Once, Subscription};
pub use config::RunnerConfig;
pub use error::{AppError, Stage};
pub use models::{AttemptId, Event, Outcome, Topic, TopicKind};
pub use runner::Runner;
pub use traits::Scraper;
pub use waiter::ResultWaiter;
pub use worker::{NullReporter, TracingWorkerReporter, WorkerEvent, WorkerReporter};
