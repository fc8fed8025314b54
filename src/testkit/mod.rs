//! Test doubles for exercising the pool without network I/O.
//!
//! Enabled for this crate's own tests and for downstream integration tests
//! via the `testkit` feature.

pub mod config;
pub mod transport;
