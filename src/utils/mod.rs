//! Ambient helpers: logging bootstrap and retry configuration.

pub mod bootstrap;
pub mod retry;
