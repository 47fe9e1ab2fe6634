//! Request gating consulted by front ends before dispatching to the registry.
//!
//! # Module Organization
//!
//! - **[`rate_limiting`]**: fixed-window per-subject counters in a shared store

pub mod rate_limiting;

pub use rate_limiting::FixedWindowRateLimiter;
