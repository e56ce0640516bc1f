use futures_convoy::{CoordinatorConfig, TaskCoordinator, UnitOfWork, WorkError};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::sleep;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_convoy=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn unit_ok(value: u64, delay_ms: u64) -> UnitOfWork<u64> {
  Box::pin(async move {
    sleep(Duration::from_millis(delay_ms)).await;
    Ok(value)
  })
}

fn unit_panicking(message: &'static str) -> UnitOfWork<u64> {
  Box::pin(async move { panic!("{message}") })
}

#[tokio::test]
async fn test_submit_and_drain_basic() {
  setup_tracing_for_test();
  let coordinator = TaskCoordinator::<u64>::new(
    CoordinatorConfig::default().concurrency_limit(2),
    Handle::current(),
    "basic",
  );
  let results = coordinator.results();

  let producer = coordinator.clone();
  tokio::spawn(async move {
    for value in 1..=4u64 {
      producer.submit(unit_ok(value, 10)).await;
    }
    producer.mark_fully_submitted();
  });

  let mut received = Vec::new();
  while let Some(result) = results.recv().await {
    received.push(result.unwrap());
  }
  received.sort_unstable();
  assert_eq!(received, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_fifo_delivery_under_limit_one() {
  setup_tracing_for_test();
  let coordinator = TaskCoordinator::<u64>::new(
    CoordinatorConfig::default().concurrency_limit(1),
    Handle::current(),
    "fifo",
  );
  let results = coordinator.results();

  // With a single admission permit, units execute and deliver strictly one
  // at a time, so delivery order matches submission order even though the
  // shortest-running unit was submitted last.
  let producer = coordinator.clone();
  tokio::spawn(async move {
    for delay in [50u64, 40, 30, 20, 10] {
      producer.submit(unit_ok(delay, delay)).await;
    }
    producer.mark_fully_submitted();
  });

  let mut received = Vec::new();
  while let Some(result) = results.recv().await {
    received.push(result.unwrap());
  }
  assert_eq!(received, vec![50, 40, 30, 20, 10]);
}

#[tokio::test]
async fn test_concurrency_ceiling_respected() {
  setup_tracing_for_test();
  let limit = 3usize;
  let coordinator = TaskCoordinator::<u64>::new(
    CoordinatorConfig::default().concurrency_limit(limit),
    Handle::current(),
    "ceiling",
  );
  let results = coordinator.results();

  let current = Arc::new(AtomicUsize::new(0));
  let high_water = Arc::new(AtomicUsize::new(0));

  let producer = coordinator.clone();
  let producer_current = current.clone();
  let producer_high_water = high_water.clone();
  tokio::spawn(async move {
    for _ in 0..20 {
      let current = producer_current.clone();
      let high_water = producer_high_water.clone();
      producer
        .submit(Box::pin(async move {
          let now = current.fetch_add(1, Ordering::SeqCst) + 1;
          high_water.fetch_max(now, Ordering::SeqCst);
          sleep(Duration::from_millis(20)).await;
          current.fetch_sub(1, Ordering::SeqCst);
          Ok(0)
        }))
        .await;
    }
    producer.mark_fully_submitted();
  });

  let mut delivered = 0;
  while results.recv().await.is_some() {
    delivered += 1;
  }
  assert_eq!(delivered, 20);
  assert!(
    high_water.load(Ordering::SeqCst) <= limit,
    "execution high-water mark {} exceeded the configured limit {}",
    high_water.load(Ordering::SeqCst),
    limit
  );
}

#[tokio::test]
async fn test_backpressure_blocks_submitter() {
  setup_tracing_for_test();
  let coordinator = TaskCoordinator::<u64>::new(
    CoordinatorConfig::default().concurrency_limit(1),
    Handle::current(),
    "backpressure",
  );
  let results = coordinator.results();
  let drain = tokio::spawn(async move {
    let mut delivered = 0;
    while results.recv().await.is_some() {
      delivered += 1;
    }
    delivered
  });

  coordinator.submit(unit_ok(1, 200)).await;

  let second_returned = Arc::new(AtomicBool::new(false));
  let flag = second_returned.clone();
  let submitter = coordinator.clone();
  tokio::spawn(async move {
    submitter.submit(unit_ok(2, 10)).await;
    flag.store(true, Ordering::SeqCst);
  });

  sleep(Duration::from_millis(100)).await;
  assert!(
    !second_returned.load(Ordering::SeqCst),
    "second submit should still be blocked on the admission gate"
  );

  sleep(Duration::from_millis(300)).await;
  assert!(
    second_returned.load(Ordering::SeqCst),
    "second submit should have proceeded once the permit freed"
  );

  coordinator.mark_fully_submitted();
  assert_eq!(drain.await.unwrap(), 2);
}

#[tokio::test]
async fn test_panic_containment_delivers_failure() {
  setup_tracing_for_test();
  let coordinator = TaskCoordinator::<u64>::new(CoordinatorConfig::default(), Handle::current(), "containment");
  let results = coordinator.results();

  let producer = coordinator.clone();
  tokio::spawn(async move {
    for value in 1..=4u64 {
      producer.submit(unit_ok(value, 20)).await;
    }
    producer.submit(unit_panicking("boom in unit five")).await;
    producer.mark_fully_submitted();
  });

  let mut successes = Vec::new();
  let mut failures: Vec<WorkError> = Vec::new();
  while let Some(result) = results.recv().await {
    match result {
      Ok(value) => successes.push(value),
      Err(error) => failures.push(error),
    }
  }

  successes.sort_unstable();
  assert_eq!(successes, vec![1, 2, 3, 4], "sibling units must be unaffected by the panic");
  assert_eq!(failures.len(), 1);
  let failure = &failures[0];
  assert!(failure.is_contained_panic());
  let rendered = failure.to_string();
  assert!(rendered.contains("panic recovered"), "missing fault marker in: {rendered}");
  assert!(rendered.contains("boom in unit five"), "missing payload in: {rendered}");
}

#[tokio::test]
async fn test_disabled_containment_drops_delivery_without_leaking() {
  setup_tracing_for_test();
  let coordinator = TaskCoordinator::<u64>::new(
    CoordinatorConfig::default().disable_fault_containment(),
    Handle::current(),
    "no_containment",
  );
  let results = coordinator.results();

  let producer = coordinator.clone();
  tokio::spawn(async move {
    producer.submit(unit_panicking("uncontained boom")).await;
    producer.submit(unit_ok(7, 20)).await;
    producer.mark_fully_submitted();
  });

  // The panicking unit unwinds into its runtime task instead of being
  // converted to a failure, so nothing is delivered for it; the scoped
  // cleanup still releases its in-flight token and the handoff closes once
  // the healthy sibling drains.
  let mut delivered = Vec::new();
  while let Some(result) = results.recv().await {
    delivered.push(result);
  }
  assert_eq!(delivered, vec![Ok(7)]);
  assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test]
async fn test_completion_closes_without_cancel() {
  setup_tracing_for_test();
  let coordinator = TaskCoordinator::<u64>::new(CoordinatorConfig::default(), Handle::current(), "feed_to_close");
  let results = coordinator.results();

  let producer = coordinator.clone();
  tokio::spawn(async move {
    for value in 0..8u64 {
      producer.submit(unit_ok(value, 15)).await;
    }
    producer.mark_fully_submitted();
  });

  let mut delivered = 0;
  while let Some(result) = results.recv().await {
    result.unwrap();
    delivered += 1;
  }
  assert_eq!(delivered, 8, "exactly one result per submitted unit");

  // The completion watcher only closes the handoff once the tracker is
  // empty, so nothing may remain in flight by the time the stream ends.
  assert_eq!(coordinator.in_flight_count(), 0);
}

#[tokio::test]
#[should_panic(expected = "mark_fully_submitted")]
async fn test_submit_after_mark_fully_submitted_panics() {
  setup_tracing_for_test();
  let coordinator = TaskCoordinator::<u64>::new(CoordinatorConfig::default(), Handle::current(), "late_submit");
  coordinator.mark_fully_submitted();
  coordinator.submit(unit_ok(1, 0)).await;
}

#[tokio::test]
async fn test_mark_fully_submitted_idempotent_with_no_work() {
  setup_tracing_for_test();
  let coordinator = TaskCoordinator::<u64>::new(CoordinatorConfig::default(), Handle::current(), "empty_feed");
  let results = coordinator.results();

  coordinator.mark_fully_submitted();
  coordinator.mark_fully_submitted();

  assert!(results.recv().await.is_none());
  assert_eq!(coordinator.in_flight_count(), 0);
}
