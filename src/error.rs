//! Error types for Turnstile.
//!
//! Only construction-time paths fail. Admission decisions are values, and
//! the protected operation's own errors pass through the guard untouched.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy that can never admit anything, or never expire
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Layered settings errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
