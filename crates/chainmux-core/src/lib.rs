//! # Chainmux Core
//!
//! Routing and consistency engine for a multi-chain node request multiplexer.
//!
//! This crate provides:
//!
//! - **[`upstream`]**: the endpoint registry ([`upstream::Multiplexer`]) with round-robin,
//!   height-aware, and weighted selection, plus the default JSON-RPC and HTTP relay helpers.
//!
//! - **[`hub`]**: the chain status hub carrying health and tip events, with in-process,
//!   pub/sub plus snapshot, and stream backends.
//!
//! - **[`sync`]**: per-endpoint poll and push tasks feeding the hub, and the single updater
//!   applying hub events to the registry.
//!
//! - **[`cache`]**: store-backed transaction presence (affinity) and result caches.
//!
//! - **[`middleware`]**: fixed-window rate limiting.
//!
//! - **[`delegator`]**: per-chain adapters and the reference EVM delegator.
//!
//! - **[`store`]**: the key/value store abstraction with Redis and in-memory implementations.
//!
//! ## Data Flow
//!
//! ```text
//!  fetch/push tasks ──► Hub ──► Updater ──► Endpoint / EndpointSet state
//!                                                   ▲
//!  request handling ── select / relay ──────────────┘
//!         │
//!         └──► presence cache, result cache, rate limiter ──► Store
//! ```
//!
//! Selection never takes a lock: per-chain aggregates are copy-on-write snapshots and
//! atomics, written only by the updater.

pub mod cache;
pub mod config;
pub mod delegator;
pub mod hub;
pub mod middleware;
pub mod store;
pub mod sync;
pub mod types;
pub mod upstream;
