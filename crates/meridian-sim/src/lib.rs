//! Simulation toolkit for integration testing.
//!
//! Provides scripted network agents, a recording configuration backend and
//! multicast kernel, a fake policy source, an expect-style callback
//! recorder, a harness wiring them into an [`Arbiter`] driven by a mock
//! clock, and deterministic churn scenarios.
//!
//! [`Arbiter`]: meridian_core::Arbiter

pub mod agent;
pub mod backend;
pub mod callback;
pub mod harness;
pub mod kernel;
pub mod policy;
pub mod scenario;

pub mod test_util;

pub use harness::{Harness, NetworkSpec, TestNetwork};
