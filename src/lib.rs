//! Ratewarden - Rate Limiting for Outbound API Clients
//!
//! This crate throttles calls to rate-limited upstream APIs with sliding
//! windows, per-identifier priority queues and circuit breakers. Window state
//! lives in process or, when configured, in a Redis server shared by every
//! instance of the service.

pub mod config;
pub mod error;
pub mod ratelimit;
