//! Shared test utilities for integration, chaos and property tests.
//!
//! This module provides:
//! - Conflict handler mocks (higher age wins, always throws, fails then fork wins)
//! - A flaky master handler wrapper with failure injection and call counts
//! - Store/link setup and document helpers

#![allow(dead_code)]

pub mod fixtures;
pub mod handlers;

pub use fixtures::*;
pub use handlers::*;
