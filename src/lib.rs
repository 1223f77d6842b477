//! Turnstile - In-process Admission Control
//!
//! This crate decides, for every incoming request, whether it may proceed or
//! must be rejected because its identity has spent its quota for the current
//! fixed window. Each policy owns a sharded in-memory window store that is
//! swept in the background; a guard wraps protected operations, attaches
//! quota headers, and rolls back charges for outcomes a policy excludes.

pub mod config;
pub mod error;
pub mod guard;
pub mod health;
pub mod ratelimit;

pub use error::{Result, TurnstileError};
