use super::*;
use crate::error::ErrorKind;
use std::sync::atomic::AtomicUsize;
use tokio::time::Instant;

/// Sets the flag when dropped, so tests can see an abandoned native future.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn never_settles(flag: Arc<AtomicBool>) -> impl Future<Output = Result<u32, Error>> {
    async move {
        let _guard = DropFlag(flag);
        std::future::pending::<()>().await;
        Ok(0)
    }
}

fn expect_control<T: std::fmt::Debug>(outcome: Result<T, Failure<Error>>) -> Error {
    match outcome {
        Err(Failure::Control(err)) => err,
        other => panic!("expected control failure, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_after_duration() {
    let dropped = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let outcome = race(
        never_settles(dropped.clone()),
        Some(Duration::from_millis(100)),
        None,
    )
    .await;

    let err = expect_control(outcome);
    assert_eq!(err.kind(), ErrorKind::Timeout);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "settled early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(150), "settled late: {:?}", elapsed);
    assert!(dropped.load(Ordering::SeqCst), "native future must be abandoned");
}

#[tokio::test(start_paused = true)]
async fn test_already_aborted_signal_fails_immediately() {
    let polled = Arc::new(AtomicUsize::new(0));
    let counter = polled.clone();
    let signal = AbortSignal::aborted("shutdown");
    let start = Instant::now();

    let outcome = race(
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(1)
        },
        Some(Duration::from_secs(5)),
        Some(&signal),
    )
    .await;

    let err = expect_control(outcome);
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.message(), "operation cancelled: shutdown");
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(polled.load(Ordering::SeqCst), 0);
    assert_eq!(signal.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_flight_cancels() {
    let controller = AbortController::new();
    let signal = controller.signal();
    let dropped = Arc::new(AtomicBool::new(false));

    let aborter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.abort_with("test finished");
    });

    let outcome = race(
        never_settles(dropped.clone()),
        Some(Duration::from_secs(10)),
        Some(&signal),
    )
    .await;
    aborter.await.unwrap();

    let err = expect_control(outcome);
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(signal.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_native_settlement_wins_and_cleans_up() {
    let controller = AbortController::new();
    let signal = controller.signal();

    let outcome = race(
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, Error>("done")
        },
        Some(Duration::from_millis(50)),
        Some(&signal),
    )
    .await;

    assert_eq!(outcome.unwrap(), "done");
    assert_eq!(signal.listener_count(), 0);

    // Aborting afterwards has nobody left to notify.
    controller.abort();
    assert!(signal.is_aborted());
}

#[tokio::test]
async fn test_native_error_is_not_control() {
    let outcome: Result<(), Failure<std::io::Error>> = race(
        async { Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")) },
        Some(Duration::from_secs(1)),
        None,
    )
    .await;

    match outcome {
        Err(Failure::Native(err)) => assert_eq!(err.to_string(), "boom"),
        other => panic!("expected native failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pass_through_without_timeout_or_signal() {
    let outcome = race(async { Ok::<_, Error>(7) }, None, None).await;
    assert_eq!(outcome.unwrap(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_and_cancel_are_distinct_kinds() {
    let controller = AbortController::new();
    let signal = controller.signal();
    controller.abort();
    let cancelled = expect_control(
        race(never_settles(Default::default()), None, Some(&signal)).await,
    );
    let timed_out = expect_control(
        race(
            never_settles(Default::default()),
            Some(Duration::from_millis(1)),
            None,
        )
        .await,
    );
    assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
    assert_eq!(timed_out.kind(), ErrorKind::Timeout);
}

#[test]
fn test_listener_unregisters_on_drop() {
    let signal = AbortSignal::default();
    let first = signal.on_abort();
    let second = signal.on_abort();
    assert_eq!(signal.listener_count(), 2);
    drop(first);
    assert_eq!(signal.listener_count(), 1);
    drop(second);
    assert_eq!(signal.listener_count(), 0);
}

#[tokio::test]
async fn test_subscribing_after_abort_resolves_immediately() {
    let controller = AbortController::new();
    controller.abort();
    controller.signal().on_abort().await;
    assert_eq!(controller.signal().reason(), None);
}

#[test]
fn test_abort_is_one_shot() {
    let controller = AbortController::new();
    controller.abort_with("first");
    controller.abort_with("second");
    assert_eq!(controller.signal().reason().as_deref(), Some("first"));
}

#[test]
fn test_control_failure_passes_through_classification() {
    let failure: Failure<std::io::Error> = Failure::Control(Error::timeout(Duration::from_millis(3)));
    assert_eq!(failure.classify().kind(), ErrorKind::Timeout);

    let failure: Failure<std::io::Error> = Failure::Native(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "reset",
    ));
    assert_eq!(failure.classify().kind(), ErrorKind::Connection);
}
