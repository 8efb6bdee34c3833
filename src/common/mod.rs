//! Shared helpers used across the session, profile and preference modules.

pub mod retry;

pub use retry::with_retry;
