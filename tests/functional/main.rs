// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the three state chains.
//!
//! These tests drive whole ticks WITHOUT requiring a live Kubernetes
//! cluster: the chains run against an in-memory object store, a scripted
//! manifest installer and a scripted pod prober.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_connection_converges_over_ticks
//! ```
//!
//! ## Test Categories
//!
//! - **Operator tests**: RegistryProxy election, install, verify and ordered uninstall
//! - **Connection tests**: dependency gating, workload convergence and health mapping
//! - **Reverse proxy tests**: the legacy chain
//! - **Engine tests**: write minimality and idempotence across ticks

#[path = "../common/mod.rs"]
mod common;

mod engine_tests;
mod mock_state;

pub use mock_state::*;

use registry_proxy_operator::crd::{ConditionStatus, Conditions};

/// `(status, reason, message)` of condition `type_`; panics when absent.
pub fn condition<'a>(conditions: &'a Conditions, type_: &str) -> (ConditionStatus, &'a str, &'a str) {
    let c = conditions
        .get(type_)
        .unwrap_or_else(|| panic!("condition {type_} not set"));
    (c.status, c.reason.as_str(), c.message.as_str())
}
