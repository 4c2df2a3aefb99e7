//! Test utilities and fixtures for the Relay Mesh integration suites
//!
//! - record and request factories
//! - an in-process registry harness bound to an ephemeral port
//! - wiremock-backed fake backends

pub mod factories;
pub mod helpers;
pub mod mocks;

pub use factories::*;
pub use helpers::*;
pub use mocks::*;
