//! Interface tests for the transaction state machine and atomic KV batches,
//! using Cucumber.
//!
//! ```bash
//! cargo test --test interfaces --features test-utils
//! ```

mod steps;

use cucumber::World;
use steps::kv_atomic::KvWorld;
use steps::transaction::TransactionWorld;

#[tokio::main]
async fn main() {
    trialkit::utils::bootstrap::try_init_tracing();

    // Run Transaction tests
    println!("\n=== Running Transaction Interface Tests ===\n");
    TransactionWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/interfaces/features/transaction.feature")
        .await;

    // Run KV atomic tests
    println!("\n=== Running KV Atomic Interface Tests ===\n");
    KvWorld::cucumber()
        .fail_on_skipped()
        .run_and_exit("tests/interfaces/features/kv_atomic.feature")
        .await;
}
