//! Ratewarden - request rate limiting core
//!
//! This crate decides, once per inbound request, whether a client may
//! proceed. Requests are matched against endpoint rules, checked against
//! per-client allow/deny/override policies, and counted in fixed windows held
//! by a pluggable counter store (in-process or Redis). The web layer calls
//! [`ratelimit::Limiter::check_limit`] and turns a rejection into a
//! "too many requests" response.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod reload;
pub mod task;
