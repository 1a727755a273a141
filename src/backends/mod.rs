//! Backend adapters.
//!
//! Each adapter wraps an existing client crate, classifies its native errors
//! into [`crate::Error`], and runs every call through [`crate::policy::settle`].

pub mod graphql;
pub mod grpc;
pub mod http;
pub mod kv;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(any(feature = "postgres", feature = "mysql", feature = "sqlite"))]
pub mod sql;
