use std::sync::Arc;
use std::time::Duration;

use weir_core::AppError;
use weir_core::testutil::{MockReporter, MockScraper};

use crate::integration::common::{PROMPT, start, start_with};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_waits_for_an_idle_worker() {
    let (scraper, gate) = MockScraper::new().gated();
    let runner = Arc::new(start(scraper, 1));

    // The only worker accepts "a" and blocks inside fetch.
    runner.add("a").await.unwrap();

    let pending = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.add("b").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished(), "add returned before a worker was free");

    gate.add_permits(1);
    let attempt = tokio::time::timeout(PROMPT, pending)
        .await
        .expect("add should return once the worker frees up")
        .unwrap();
    assert!(attempt.is_ok());

    gate.add_permits(1);
    runner.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_add_is_never_processed() {
    let reporter = MockReporter::new();
    let (scraper, gate) = MockScraper::new().gated();
    let runner = start_with(scraper.clone(), 1, reporter.clone());
    let mut sub = runner.subscribe("b");

    runner.add("a").await.unwrap();
    let gave_up = tokio::time::timeout(Duration::from_millis(20), runner.add("b")).await;
    assert!(gave_up.is_err(), "add returned while the only worker was busy");

    gate.add_permits(1);
    runner.shutdown().await;

    assert_eq!(scraper.fetched(), vec!["a".to_string()]);
    assert_eq!(reporter.count("Withdrawn"), 1);
    assert!(sub.recv_timeout(Duration::from_millis(20)).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_concurrency_is_bounded() {
    let scraper = MockScraper::new().with_default_delay(Duration::from_millis(15));
    let runner = Arc::new(start(scraper.clone(), 2));

    let adds: Vec<_> = (0..10)
        .map(|i| {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.add(format!("k{i}")).await })
        })
        .collect();
    for add in adds {
        add.await.unwrap().unwrap();
    }
    runner.shutdown().await;

    assert_eq!(scraper.fetched().len(), 10);
    assert!(scraper.max_in_flight() <= 2);
    assert!(scraper.max_in_flight() >= 1);
}

#[tokio::test]
async fn close_then_add_fails_without_hanging() {
    let runner = start(MockScraper::new(), 1);
    assert!(runner.close());

    let result = tokio::time::timeout(Duration::from_millis(100), runner.add("c"))
        .await
        .expect("add after close must not hang");
    assert_eq!(result, Err(AppError::ClosedQueue));

    // Second close is a no-op.
    assert!(!runner.close());
    assert_eq!(runner.add("d").await, Err(AppError::ClosedQueue));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adds_issued_before_close_all_return() {
    let scraper = MockScraper::new().with_default_delay(Duration::from_millis(5));
    let runner = Arc::new(start(scraper.clone(), 2));

    let adds: Vec<_> = (0..12)
        .map(|i| {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.add(format!("k{i}")).await })
        })
        .collect();

    let mut accepted = 0;
    for add in adds {
        if tokio::time::timeout(PROMPT, add).await.unwrap().unwrap().is_ok() {
            accepted += 1;
        }
    }
    runner.close();
    runner.shutdown().await;

    assert_eq!(accepted, 12);
    assert_eq!(scraper.fetched().len(), 12);
}

#[tokio::test]
async fn in_flight_attempt_publishes_after_close() {
    let scraper = MockScraper::new().with_delay("slow", Duration::from_millis(30));
    let runner = start(scraper, 1);

    let waiter = runner.submit("slow").await.unwrap();
    runner.close();

    assert_eq!(
        tokio::time::timeout(PROMPT, waiter.recv()).await.unwrap(),
        Ok("SLOW".to_string())
    );
    runner.shutdown().await;
}

#[tokio::test]
async fn dropping_runner_releases_waiters() {
    let runner = start(MockScraper::new(), 1);
    let waiter = runner.wait_result("never-added");
    drop(runner);

    let result = tokio::time::timeout(PROMPT, waiter.recv())
        .await
        .expect("waiter should resolve once the runner is gone");
    assert_eq!(result, Err(AppError::SubscriptionClosed));
}

#[tokio::test]
async fn reporter_sees_worker_lifecycle() {
    let reporter = MockReporter::new();
    let scraper = MockScraper::new().with_rows("a", &["ok", "bad"]);
    let runner = start_with(scraper, 2, reporter.clone());

    let waiter = runner.submit("a").await.unwrap();
    waiter.recv().await.unwrap();
    runner.shutdown().await;

    assert_eq!(reporter.count("Started"), 2);
    assert_eq!(reporter.count("Accepted"), 1);
    assert_eq!(reporter.count("RowsSkipped"), 1);
    assert_eq!(reporter.count("Published"), 1);
    assert_eq!(reporter.count("Stopped"), 2);
}
