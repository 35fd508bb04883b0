//! # StrataDB Configuration Module
//!
//! This module centralizes all configuration constants for the engine.
//! Constants are grouped by their functional area and interdependencies are
//! documented and enforced through compile-time assertions.
//!
//! Scattered constants across multiple files lead to bugs where
//! interdependent values drift apart (a WAL frame sized for one page size,
//! a buffer pool smaller than its shard count). Co-locating them with
//! compile-time checks prevents that class of mismatch.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;
