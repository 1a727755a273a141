use super::*;
use crate::error::ErrorKind;
use crate::test_utils::MockSource;
use serde_json::json;
use std::time::Duration;

fn options() -> TransactionOptions {
    TransactionOptions::new()
}

async fn open(source: &MockSource) -> Transaction<crate::test_utils::MockConnection> {
    Transaction::begin(source.connection(), &options())
        .await
        .unwrap()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_begin_applies_isolation() {
    let source = MockSource::new();
    let tx = Transaction::begin(
        source.connection(),
        &options().isolation(IsolationLevel::Serializable),
    )
    .await
    .unwrap();

    assert_eq!(tx.state(), TransactionState::Active);
    assert_eq!(
        source.journal().began,
        vec![Some(IsolationLevel::Serializable)]
    );
    drop(tx);
}

#[tokio::test]
async fn test_begin_failure_releases_connection() {
    let source = MockSource::new().fail_begin(Error::new(ErrorKind::Connection, "reset"));

    let err = Transaction::begin(source.connection(), &options())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(source.journal().releases, 1);
}

#[tokio::test]
async fn test_commit_moves_to_committed_and_releases_once() {
    let source = MockSource::new();
    let mut tx = open(&source).await;

    tx.query("INSERT INTO t VALUES (1)", &[], &CallOptions::new())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(tx.state(), TransactionState::Committed);
    drop(tx);
    let journal = source.journal();
    assert_eq!(journal.commits, 1);
    assert_eq!(journal.releases, 1);
}

#[tokio::test]
async fn test_rollback_moves_to_rolled_back() {
    let source = MockSource::new();
    let mut tx = open(&source).await;

    tx.rollback().await.unwrap();

    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(source.journal().rollbacks, 1);
    assert_eq!(source.journal().releases, 1);
}

#[tokio::test]
async fn test_failed_commit_still_releases_and_ends_rolled_back() {
    let source = MockSource::new().fail_commit(
        Error::new(ErrorKind::SerializationConflict, "could not serialize").with_code("40001"),
    );
    let mut tx = open(&source).await;

    let err = tx.commit().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SerializationConflict);
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(source.journal().releases, 1);
}

#[tokio::test]
async fn test_failed_rollback_still_releases() {
    let source = MockSource::new().fail_rollback(Error::new(ErrorKind::Connection, "gone"));
    let mut tx = open(&source).await;

    assert!(tx.rollback().await.is_err());
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(source.journal().releases, 1);
}

#[tokio::test]
async fn test_commit_and_rollback_report_results() {
    let source = MockSource::new();

    let mut tx = open(&source).await;
    let committed = tx.commit().await.unwrap();
    assert!(committed.ok());
    assert_eq!(committed.kind(), ResultKind::Commit);

    let mut tx = open(&source).await;
    let rolled_back = tx.rollback().await.unwrap();
    assert!(rolled_back.ok());
    assert_eq!(rolled_back.kind(), ResultKind::Rollback);
}

#[tokio::test(start_paused = true)]
async fn test_commit_that_never_settles_times_out_and_releases() {
    let source = MockSource::new().delay_commits(Duration::from_secs(3600));
    let mut tx = open(&source).await;

    let err = tx
        .commit_with(&CallOptions::new().timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(tx.state(), TransactionState::RolledBack);
    let journal = source.journal();
    assert_eq!(journal.commits, 1);
    assert_eq!(journal.releases, 1);

    let err = tx.commit().await.unwrap_err();
    assert!(err.is_transaction_finished());
    assert_eq!(source.journal().releases, 1);
}

#[tokio::test(start_paused = true)]
async fn test_commit_inherits_default_timeout() {
    let source = MockSource::new().delay_commits(Duration::from_secs(3600));
    let options = TransactionOptions {
        defaults: ClientDefaults {
            timeout: Some(Duration::from_secs(1)),
            ..ClientDefaults::default()
        },
        ..options()
    };
    let mut tx = Transaction::begin(source.connection(), &options)
        .await
        .unwrap();

    let err = tx.commit().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(source.journal().releases, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_aborted_by_signal_still_releases() {
    let source = MockSource::new().delay_rollbacks(Duration::from_secs(3600));
    let controller = crate::cancel::AbortController::new();
    let mut tx = open(&source).await;

    let signal = controller.signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.abort_with("test over");
    });
    let err = tx
        .rollback_with(&CallOptions::new().signal(signal))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(source.journal().releases, 1);
}

// ============================================================================
// Terminal state
// ============================================================================

#[tokio::test]
async fn test_calls_after_commit_fail_fast() {
    let source = MockSource::new();
    let mut tx = open(&source).await;
    tx.commit().await.unwrap();

    let query_err = tx
        .query("SELECT 1", &[], &CallOptions::new())
        .await
        .unwrap_err();
    let commit_err = tx.commit().await.unwrap_err();
    let rollback_err = tx.rollback().await.unwrap_err();

    for err in [&query_err, &commit_err, &rollback_err] {
        assert!(err.is_transaction_finished());
        assert_eq!(err.message(), "transaction already committed");
    }
    let journal = source.journal();
    assert!(journal.executed.is_empty());
    assert_eq!(journal.commits, 1);
    assert_eq!(journal.rollbacks, 0);
    assert_eq!(journal.releases, 1);
}

#[tokio::test]
async fn test_calls_after_rollback_fail_fast() {
    let source = MockSource::new();
    let mut tx = open(&source).await;
    tx.rollback().await.unwrap();

    let err = tx.commit().await.unwrap_err();
    assert!(err.is_transaction_finished());
    assert_eq!(err.message(), "transaction already rolled back");
    assert_eq!(source.journal().commits, 0);
}

#[tokio::test]
async fn test_dropping_active_transaction_releases() {
    let source = MockSource::new();
    let tx = open(&source).await;
    drop(tx);

    let journal = source.journal();
    assert_eq!(journal.releases, 1);
    assert_eq!(journal.commits, 0);
}

// ============================================================================
// Statements
// ============================================================================

#[tokio::test]
async fn test_query_failure_keeps_transaction_active() {
    let source = MockSource::new().fail_statement(
        "INSERT",
        Error::new(ErrorKind::ConstraintViolation, "duplicate key").with_code("23505"),
    );
    let mut tx = open(&source).await;

    let result = tx
        .query(
            "INSERT INTO users VALUES ($1)",
            &[json!(1)],
            &CallOptions::new().throw_on_error(false),
        )
        .await
        .unwrap();

    assert!(!result.ok());
    assert_eq!(result.kind(), ResultKind::Query);
    assert_eq!(
        result.error().unwrap().kind(),
        ErrorKind::ConstraintViolation
    );
    assert!(tx.is_active());

    let thrown = tx
        .query("INSERT INTO users VALUES ($1)", &[json!(1)], &CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(thrown.code(), Some("23505"));
    assert!(tx.is_active());

    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_query_returns_rows() {
    let rows = vec![json!({"id": 1}).as_object().unwrap().clone()];
    let source = MockSource::new().respond("SELECT", QueryPayload::from_rows(rows));
    let mut tx = open(&source).await;

    let result = tx
        .query("SELECT id FROM t", &[], &CallOptions::new())
        .await
        .unwrap();

    assert!(result.ok());
    assert_eq!(result.payload().unwrap().row_count, 1);
    tx.commit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_query_timeout_is_always_thrown() {
    let source = MockSource::new().delay_statements(Duration::from_secs(5));
    let mut tx = open(&source).await;

    let err = tx
        .query(
            "SELECT pg_sleep(5)",
            &[],
            &CallOptions::new()
                .timeout(Duration::from_millis(50))
                .throw_on_error(false),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(tx.is_active());
    tx.rollback().await.unwrap();
}

// ============================================================================
// run_in_transaction
// ============================================================================

#[tokio::test]
async fn test_run_in_transaction_commits_on_ok() {
    let source = MockSource::new();

    let value = run_in_transaction(&source, options(), |tx| {
        Box::pin(async move {
            tx.query("UPDATE a SET n = n - 1", &[], &CallOptions::new())
                .await?;
            tx.query("UPDATE b SET n = n + 1", &[], &CallOptions::new())
                .await?;
            Ok(2)
        })
    })
    .await
    .unwrap();

    assert_eq!(value, 2);
    let journal = source.journal();
    assert_eq!(journal.reserved, 1);
    assert_eq!(journal.executed.len(), 2);
    assert_eq!(journal.commits, 1);
    assert_eq!(journal.rollbacks, 0);
    assert_eq!(journal.releases, 1);
}

#[tokio::test]
async fn test_run_in_transaction_rolls_back_on_err() {
    let source = MockSource::new().fail_statement(
        "b",
        Error::new(ErrorKind::Deadlock, "deadlock detected"),
    );

    let err = run_in_transaction(&source, options(), |tx| {
        Box::pin(async move {
            tx.query("UPDATE a SET n = 1", &[], &CallOptions::new())
                .await?;
            tx.query("UPDATE b SET n = 1", &[], &CallOptions::new())
                .await?;
            Ok(())
        })
    })
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Deadlock);
    let journal = source.journal();
    assert_eq!(journal.commits, 0);
    assert_eq!(journal.rollbacks, 1);
    assert_eq!(journal.releases, 1);
}

#[tokio::test]
async fn test_run_in_transaction_respects_explicit_finish() {
    let source = MockSource::new();

    run_in_transaction(&source, options(), |tx| {
        Box::pin(async move {
            tx.rollback().await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    let journal = source.journal();
    assert_eq!(journal.commits, 0);
    assert_eq!(journal.rollbacks, 1);
    assert_eq!(journal.releases, 1);
}

#[tokio::test]
async fn test_run_in_transaction_reserve_failure() {
    let source = MockSource::new().fail_reserve(Error::new(ErrorKind::ResourceExhausted, "pool"));

    let err = run_in_transaction(&source, options(), |_tx| Box::pin(async { Ok(()) }))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(source.journal().releases, 0);
}

#[tokio::test]
async fn test_run_in_transaction_cancelled_before_reserve() {
    let source = MockSource::new();
    let call = CallOptions::new().signal(crate::cancel::AbortSignal::aborted("stop"));

    let err = run_in_transaction(&source, options().call(call), |_tx| {
        Box::pin(async { Ok(()) })
    })
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(source.journal().reserved, 0);
}

#[test]
fn test_isolation_sql_and_labels() {
    assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
    let level: IsolationLevel = serde_json::from_str("\"read-committed\"").unwrap();
    assert_eq!(level, IsolationLevel::ReadCommitted);
    assert_eq!(TransactionState::RolledBack.to_string(), "rolled back");
    assert!(TransactionState::Committed.is_terminal());
    assert!(!TransactionState::Active.is_terminal());
}
