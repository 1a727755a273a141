//! Transaction lifecycle step definitions.

use cucumber::{given, then, when, World};
use serde_json::Value;
use trialkit::test_utils::{MockConnection, MockSource};
use trialkit::{
    run_in_transaction, CallOptions, Error, IsolationLevel, Transaction, TransactionOptions,
};

use super::parse_kind;

/// Test context for transaction scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct TransactionWorld {
    source: MockSource,
    tx: Option<Transaction<MockConnection>>,
    last_error: Option<Error>,
}

impl TransactionWorld {
    fn new() -> Self {
        Self {
            source: MockSource::new(),
            tx: None,
            last_error: None,
        }
    }

    fn tx(&mut self) -> &mut Transaction<MockConnection> {
        self.tx.as_mut().expect("No open transaction")
    }

    fn record(&mut self, outcome: Result<(), Error>) {
        if let Err(error) = outcome {
            self.last_error = Some(error);
        }
    }

    async fn open(&mut self, options: TransactionOptions) {
        let tx = Transaction::begin(self.source.connection(), &options)
            .await
            .expect("Failed to begin transaction");
        self.tx = Some(tx);
    }
}

fn scripted(kind: &str) -> Error {
    Error::new(parse_kind(kind), format!("scripted {}", kind))
}

fn parse_isolation(level: &str) -> IsolationLevel {
    serde_json::from_value(Value::String(level.to_string()))
        .unwrap_or_else(|_| panic!("unknown isolation level {:?}", level))
}

// --- Background ---

#[given("a scripted connection source")]
async fn given_scripted_source(world: &mut TransactionWorld) {
    world.source = MockSource::new();
}

// --- Given steps ---

#[given(expr = "commits fail with kind {string}")]
async fn given_commits_fail(world: &mut TransactionWorld, kind: String) {
    world.source = std::mem::take(&mut world.source).fail_commit(scripted(&kind));
}

#[given(expr = "statements containing {string} fail with kind {string}")]
async fn given_statements_fail(world: &mut TransactionWorld, pattern: String, kind: String) {
    world.source = std::mem::take(&mut world.source).fail_statement(pattern, scripted(&kind));
}

#[given("an open transaction")]
async fn given_open_transaction(world: &mut TransactionWorld) {
    world.open(TransactionOptions::new()).await;
}

#[given(expr = "an open transaction with isolation {string}")]
async fn given_open_transaction_with_isolation(world: &mut TransactionWorld, level: String) {
    world
        .open(TransactionOptions::new().isolation(parse_isolation(&level)))
        .await;
}

// --- When steps ---

#[when(expr = "the statement {string} runs")]
async fn when_statement_runs(world: &mut TransactionWorld, sql: String) {
    let outcome = world
        .tx()
        .query(&sql, &[], &CallOptions::new())
        .await
        .map(|_| ());
    world.record(outcome);
}

#[when("the transaction commits")]
async fn when_commit(world: &mut TransactionWorld) {
    let outcome = world.tx().commit().await.map(|_| ());
    world.record(outcome);
}

#[when("the transaction rolls back")]
async fn when_rollback(world: &mut TransactionWorld) {
    let outcome = world.tx().rollback().await.map(|_| ());
    world.record(outcome);
}

#[when("the transaction is dropped")]
async fn when_dropped(world: &mut TransactionWorld) {
    world.tx = None;
}

#[when(expr = "a transaction body runs {int} statement(s) and succeeds")]
async fn when_body_succeeds(world: &mut TransactionWorld, count: usize) {
    let outcome = run_in_transaction(&world.source, TransactionOptions::new(), |tx| {
        Box::pin(async move {
            for i in 0..count {
                tx.query(
                    "INSERT INTO audit (step) VALUES (?)",
                    &[Value::from(i)],
                    &CallOptions::new(),
                )
                .await?;
            }
            Ok(())
        })
    })
    .await;
    world.record(outcome);
}

#[when(expr = "a transaction body runs {int} statement(s) and fails")]
async fn when_body_fails(world: &mut TransactionWorld, count: usize) {
    let outcome = run_in_transaction(&world.source, TransactionOptions::new(), |tx| {
        Box::pin(async move {
            for i in 0..count {
                tx.query(
                    "INSERT INTO audit (step) VALUES (?)",
                    &[Value::from(i)],
                    &CallOptions::new(),
                )
                .await?;
            }
            Err::<(), _>(scripted("internal"))
        })
    })
    .await;
    world.record(outcome);
}

// --- Then steps ---

#[then(expr = "the transaction is {string}")]
async fn then_state(world: &mut TransactionWorld, state: String) {
    assert_eq!(world.tx().state().to_string(), state);
}

#[then(expr = "the last call failed with kind {string} and message {string}")]
async fn then_last_error(world: &mut TransactionWorld, kind: String, message: String) {
    let error = world.last_error.as_ref().expect("Expected a failed call");
    assert_eq!(error.kind(), parse_kind(&kind));
    assert!(
        error.message().contains(&message),
        "Expected message containing {:?}, got {:?}",
        message,
        error.message()
    );
}

#[then(expr = "the connection was released {int} time(s)")]
async fn then_released(world: &mut TransactionWorld, count: usize) {
    assert_eq!(world.source.journal().releases, count);
}

#[then(expr = "{int} commit(s) was/were issued")]
async fn then_commits(world: &mut TransactionWorld, count: usize) {
    assert_eq!(world.source.journal().commits, count);
}

#[then(expr = "{int} rollback(s) was/were issued")]
async fn then_rollbacks(world: &mut TransactionWorld, count: usize) {
    assert_eq!(world.source.journal().rollbacks, count);
}

#[then(expr = "{int} statement(s) was/were executed")]
async fn then_statements(world: &mut TransactionWorld, count: usize) {
    assert_eq!(world.source.journal().executed.len(), count);
}

#[then(expr = "the connection began with isolation {string}")]
async fn then_began_with(world: &mut TransactionWorld, level: String) {
    assert_eq!(
        world.source.journal().began,
        vec![Some(parse_isolation(&level))]
    );
}
