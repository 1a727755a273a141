//! Test utilities and mock implementations.
//!
//! This module provides a scripted in-memory connection for exercising the
//! transaction state machine without a database.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;
use crate::result::QueryPayload;
use crate::transaction::{ConnectionSource, IsolationLevel, ReservedConnection};

/// Everything the mock connection was asked to do, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Journal {
    pub reserved: usize,
    pub began: Vec<Option<IsolationLevel>>,
    pub executed: Vec<String>,
    pub params: Vec<Vec<Value>>,
    pub commits: usize,
    pub rollbacks: usize,
    pub releases: usize,
}

#[derive(Debug, Default)]
struct Script {
    fail_reserve: Option<Error>,
    fail_begin: Option<Error>,
    fail_commit: Option<Error>,
    fail_rollback: Option<Error>,
    fail_statements: Vec<(String, Error)>,
    responses: Vec<(String, QueryPayload)>,
    statement_delay: Option<Duration>,
    commit_delay: Option<Duration>,
    rollback_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct MockState {
    journal: Journal,
    script: Script,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock connection pool. Every reserved connection shares one journal.
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    state: Arc<Mutex<MockState>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next and all later `reserve` calls.
    pub fn fail_reserve(self, error: Error) -> Self {
        lock(&self.state).script.fail_reserve = Some(error);
        self
    }

    pub fn fail_begin(self, error: Error) -> Self {
        lock(&self.state).script.fail_begin = Some(error);
        self
    }

    pub fn fail_commit(self, error: Error) -> Self {
        lock(&self.state).script.fail_commit = Some(error);
        self
    }

    pub fn fail_rollback(self, error: Error) -> Self {
        lock(&self.state).script.fail_rollback = Some(error);
        self
    }

    /// Fail any statement containing `pattern`.
    pub fn fail_statement(self, pattern: impl Into<String>, error: Error) -> Self {
        lock(&self.state)
            .script
            .fail_statements
            .push((pattern.into(), error));
        self
    }

    /// Answer any statement containing `pattern` with `payload`.
    pub fn respond(self, pattern: impl Into<String>, payload: QueryPayload) -> Self {
        lock(&self.state)
            .script
            .responses
            .push((pattern.into(), payload));
        self
    }

    /// Make every statement wait before answering.
    pub fn delay_statements(self, delay: Duration) -> Self {
        lock(&self.state).script.statement_delay = Some(delay);
        self
    }

    /// Make every commit wait before answering.
    pub fn delay_commits(self, delay: Duration) -> Self {
        lock(&self.state).script.commit_delay = Some(delay);
        self
    }

    pub fn delay_rollbacks(self, delay: Duration) -> Self {
        lock(&self.state).script.rollback_delay = Some(delay);
        self
    }

    /// A connection bound to this source's journal, without going through `reserve`.
    pub fn connection(&self) -> MockConnection {
        MockConnection {
            state: Arc::clone(&self.state),
        }
    }

    /// Snapshot of the journal.
    pub fn journal(&self) -> Journal {
        lock(&self.state).journal.clone()
    }
}

#[async_trait]
impl ConnectionSource for MockSource {
    type Connection = MockConnection;

    async fn reserve(&self) -> Result<MockConnection, Error> {
        let mut state = lock(&self.state);
        if let Some(error) = state.script.fail_reserve.clone() {
            return Err(error);
        }
        state.journal.reserved += 1;
        drop(state);
        Ok(self.connection())
    }
}

/// Scripted connection recording into its source's journal.
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl ReservedConnection for MockConnection {
    type Error = Error;

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if let Some(error) = state.script.fail_begin.clone() {
            return Err(error);
        }
        state.journal.began.push(isolation);
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryPayload, Error> {
        let (delay, answer) = {
            let mut state = lock(&self.state);
            state.journal.executed.push(sql.to_string());
            state.journal.params.push(params.to_vec());
            let failure = state
                .script
                .fail_statements
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, error)| error.clone());
            let answer = match failure {
                Some(error) => Err(error),
                None => Ok(state
                    .script
                    .responses
                    .iter()
                    .find(|(pattern, _)| sql.contains(pattern.as_str()))
                    .map(|(_, payload)| payload.clone())
                    .unwrap_or_else(|| QueryPayload::affected(1, None))),
            };
            (state.script.statement_delay, answer)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        answer
    }

    async fn commit(&mut self) -> Result<(), Error> {
        let (delay, answer) = {
            let mut state = lock(&self.state);
            state.journal.commits += 1;
            (state.script.commit_delay, state.script.fail_commit.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        answer.map_or(Ok(()), Err)
    }

    async fn rollback(&mut self) -> Result<(), Error> {
        let (delay, answer) = {
            let mut state = lock(&self.state);
            state.journal.rollbacks += 1;
            (state.script.rollback_delay, state.script.fail_rollback.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        answer.map_or(Ok(()), Err)
    }

    fn release(&mut self) {
        // Count every call so double releases show up in the journal.
        lock(&self.state).journal.releases += 1;
    }
}
