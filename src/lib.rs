//! Tollgate - Per-key Admission Control
//!
//! This crate implements a token bucket rate limiter that decides in constant
//! time whether a caller's request may proceed. Tokens accrue lazily from
//! elapsed time, so no background refill process exists; a sweeper task only
//! drops state for keys that have gone idle.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod simulate;
