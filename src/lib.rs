//! Trialkit - scenario-testing clients
//!
//! Adapters for driving integration tests against live services (HTTP,
//! gRPC/Connect, GraphQL, SQL, Redis, AMQP, key-value stores). Every operation returns
//! the same result envelope, fails with the same error taxonomy, honours the
//! same timeout/cancellation options, and can be checked with the same fluent
//! assertions:
//!
//! ```rust,ignore
//! use trialkit::{expect, CallOptions};
//!
//! let result = sql.query("SELECT * FROM users", &[], &CallOptions::new()).await?;
//! expect(&result).ok().rows(2).row_contains(json!({"name": "Alice"}));
//! ```

pub mod backends;
pub mod cancel;
pub mod config;
pub mod error;
pub mod expect;
pub mod policy;
pub mod result;
pub mod subscription;
pub mod transaction;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cancel::{race, AbortController, AbortSignal, Failure};
pub use config::ToolkitConfig;
pub use error::{Classify, Error, ErrorDetails, ErrorKind};
pub use expect::{expect, Expectation, Inspect};
pub use policy::{CallOptions, ClientDefaults};
pub use result::{
    AckPayload, CountPayload, ListPayload, OpResult, Outcome, QueryPayload, ResultKind, Row,
    StringMap, ValuePayload,
};
pub use subscription::Subscription;
pub use transaction::{
    run_in_transaction, ConnectionSource, IsolationLevel, ReservedConnection, Transaction,
    TransactionOptions, TransactionState,
};
