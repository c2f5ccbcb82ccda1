//! Shared test utilities for resilient-client test suites.
//!
//! This crate provides:
//! - Proptest generators for profiles, retry blocks and error kinds
//! - Wiremock-backed identity provider and downstream helpers
//! - Fixtures with sample profiles, configuration and token bodies

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod mocks;

pub use generators::*;
