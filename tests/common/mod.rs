//! Common test utilities for etree-dl integration tests

#[allow(dead_code)]
pub mod fixtures;

pub use fixtures::*;
