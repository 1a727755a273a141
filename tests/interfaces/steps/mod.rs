//! Cucumber step definitions for interface tests.

pub mod kv_atomic;
pub mod transaction;

use trialkit::ErrorKind;

/// Parse a kebab-case error kind label.
pub fn parse_kind(label: &str) -> ErrorKind {
    ErrorKind::ALL
        .into_iter()
        .find(|kind| kind.as_str() == label)
        .unwrap_or_else(|| panic!("unknown error kind {:?}", label))
}
