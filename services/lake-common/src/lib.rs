//! Shared foundation for the lake services.
//!
//! Carries the pieces every service needs: configuration loading with
//! environment overrides, structured logging initialization, and the
//! process-level error type that maps onto exit codes.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{FatalError, Result};
