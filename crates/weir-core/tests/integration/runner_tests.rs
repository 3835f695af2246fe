use std::collections::HashSet;
use std::time::{Duration, Instant};

use futures::StreamExt;
use weir_core::testutil::MockScraper;
use weir_core::{AppError, Outcome, TopicKind};

use crate::integration::common::{GRACE, PROMPT, start};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_key_gets_exactly_one_outcome() {
    let mut scraper = MockScraper::new();
    for i in 0..20 {
        let key = format!("k{i}");
        scraper = match i % 3 {
            0 => scraper.with_fetch_error(&key, AppError::Generic("unreachable".into())),
            1 => scraper.with_extract_error(&key, AppError::Generic("garbled".into())),
            _ => scraper.with_rows(&key, &["row"]),
        };
    }
    let runner = start(scraper, 3);

    let mut subs: Vec<_> = (0..20)
        .map(|i| (i, runner.subscribe(&format!("k{i}"))))
        .collect();
    for i in 0..20 {
        runner.add(format!("k{i}")).await.unwrap();
    }
    runner.shutdown().await;

    for (i, sub) in subs.iter_mut() {
        let event = sub.recv_timeout(PROMPT).await.unwrap();
        assert_eq!(event.key, format!("k{i}"));
        assert_eq!(event.outcome.is_success(), *i % 3 == 2, "key k{i}");
        assert_eq!(
            event.outcome.kind(),
            if *i % 3 == 2 {
                TopicKind::Result
            } else {
                TopicKind::Error
            }
        );

        let extra = sub.recv_timeout(Duration::from_millis(10)).await;
        assert!(extra.is_err(), "k{i} received a second outcome");
    }
}

#[tokio::test]
async fn skipped_rows_do_not_fail_the_attempt() {
    let runner = start(MockScraper::new().with_rows("a", &["r1", "bad-r2"]), 1);

    let waiter = runner.wait_result("a");
    let outcome = runner.subscribe_once("a");
    runner.add("a").await.unwrap();

    assert_eq!(waiter.recv().await, Ok("R1".to_string()));
    let event = outcome.recv().await.unwrap();
    assert_eq!(
        event.outcome,
        Outcome::Success {
            rows: vec!["R1".to_string()]
        }
    );
}

#[tokio::test]
async fn fetch_failure_is_returned_as_error() {
    let runner = start(
        MockScraper::new().with_fetch_error("b", AppError::Generic("timeout".into())),
        1,
    );

    let waiter = runner.submit("b").await.unwrap();
    let err = waiter.recv().await.unwrap_err();
    assert_eq!(
        err,
        AppError::Fetch {
            key: "b".into(),
            message: "timeout".into()
        }
    );
}

#[tokio::test]
async fn extract_failure_goes_to_error_topic() {
    let runner = start(
        MockScraper::new().with_extract_error("x", AppError::Generic("not html".into())),
        1,
    );
    let mut errors = runner.subscribe_errors("x");
    let mut results = runner.subscribe_results("x");

    runner.add("x").await.unwrap();

    let event = errors.recv_timeout(PROMPT).await.unwrap();
    assert!(matches!(
        event.outcome,
        Outcome::Failure {
            cause: AppError::Extract { .. }
        }
    ));
    assert!(results.recv_timeout(Duration::from_millis(20)).await.is_err());
}

#[tokio::test]
async fn empty_success_is_no_rows_for_one_result() {
    let runner = start(MockScraper::new().with_rows("e", &[]), 1);

    let waiter = runner.submit("e").await.unwrap();
    assert_eq!(
        waiter.recv().await,
        Err(AppError::NoRows { key: "e".into() })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_of_one_key_stay_independent() {
    let scraper = MockScraper::new().with_default_delay(Duration::from_millis(10));
    let runner = start(scraper.clone(), 2);

    let (first, second) = tokio::join!(runner.submit("k"), runner.submit("k"));
    let (first, second) = (first.unwrap(), second.unwrap());
    let bound: HashSet<_> = [first.attempt(), second.attempt()].into_iter().collect();
    assert_eq!(bound.len(), 2);

    let (e1, e2) = tokio::join!(first.recv_event(), second.recv_event());
    let received: HashSet<_> = [Some(e1.unwrap().attempt), Some(e2.unwrap().attempt)]
        .into_iter()
        .collect();

    assert_eq!(received, bound);
    assert_eq!(scraper.fetched(), vec!["k".to_string(), "k".to_string()]);
}

#[tokio::test]
async fn independent_waiters_share_one_outcome() {
    let runner = start(MockScraper::new(), 1);

    let first = runner.wait_result("k");
    let second = runner.wait_result("k");
    let attempt = runner.add("k").await.unwrap();

    assert_eq!(
        tokio::time::timeout(PROMPT, first.recv()).await.unwrap(),
        Ok("K".to_string())
    );
    let event = tokio::time::timeout(PROMPT, second.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.attempt, attempt);

    // Both waiters detached after the single delivery.
    runner.shutdown().await;
    assert_eq!(runner.bus().topic_count(), 0);
}

#[tokio::test]
async fn outcome_is_dropped_without_subscriber() {
    let runner = start(MockScraper::new(), 1);

    runner.add("early").await.unwrap();
    runner.shutdown().await;

    // Subscribing after the attempt completed never sees it.
    let mut late = runner.subscribe("early");
    assert!(late.recv_timeout(Duration::from_millis(20)).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_subscriber_costs_at_most_grace_per_publish() {
    let runner = start(MockScraper::new(), 1);
    let _stalled = runner.subscribe_results("s");

    let start = Instant::now();
    for _ in 0..5 {
        runner.add("s").await.unwrap();
    }
    runner.shutdown().await;
    let elapsed = start.elapsed();

    // First publish fills the buffer; the other four wait out the grace period.
    assert!(elapsed >= GRACE * 4, "publish did not wait: {elapsed:?}");
    assert!(elapsed < PROMPT, "pool stalled: {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publishing_without_subscribers_never_stalls() {
    let runner = start(MockScraper::new(), 2);

    let start = Instant::now();
    for i in 0..50 {
        runner.add(format!("k{i}")).await.unwrap();
    }
    runner.shutdown().await;

    assert!(start.elapsed() < PROMPT);
}

#[tokio::test]
async fn repeatable_subscription_streams_every_attempt() {
    let runner = start(MockScraper::new().with_rows("r", &["x"]), 1);
    let sub = runner.subscribe("r");
    let collector = tokio::spawn(tokio::time::timeout(
        PROMPT,
        sub.take(2).collect::<Vec<_>>(),
    ));

    runner.add("r").await.unwrap();
    runner.add("r").await.unwrap();

    let events = collector.await.unwrap().unwrap();
    assert_eq!(events.len(), 2);
    assert_ne!(events[0].attempt, events[1].attempt);
    assert!(events.iter().all(|e| e.outcome.is_success()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_waiter_on_plain_thread() {
    let runner = start(MockScraper::new().with_rows("t", &["hello"]), 1);
    let waiter = runner.wait_result("t");

    let handle = std::thread::spawn(move || waiter.blocking_recv());
    runner.add("t").await.unwrap();

    let row = tokio::task::spawn_blocking(move || handle.join().unwrap())
        .await
        .unwrap();
    assert_eq!(row, Ok("HELLO".to_string()));
}
