use std::time::Duration;

use weir_core::testutil::MockScraper;
use weir_core::{NullReporter, Runner, RunnerConfig, WorkerReporter};

/// Grace period used by every integration runner.
pub const GRACE: Duration = Duration::from_millis(20);

/// Generous upper bound for waits that should complete promptly.
pub const PROMPT: Duration = Duration::from_secs(2);

pub fn test_config(workers: usize) -> RunnerConfig {
    RunnerConfig::default()
        .with_worker_count(workers)
        .with_publish_grace(GRACE)
}

/// Starts a silent runner over `scraper`.
pub fn start(scraper: MockScraper, workers: usize) -> Runner<MockScraper> {
    start_with(scraper, workers, NullReporter)
}

pub fn start_with<WR: WorkerReporter + 'static>(
    scraper: MockScraper,
    workers: usize,
    reporter: WR,
) -> Runner<MockScraper> {
    Runner::with_reporter(scraper, test_config(workers), reporter)
        .expect("runner should start inside the test runtime")
}
