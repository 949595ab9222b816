//! Process-level error types.

use thiserror::Error;

/// Result type alias for fatal, process-terminating errors.
pub type Result<T> = std::result::Result<T, FatalError>;

/// Errors that terminate the process.
///
/// Everything recoverable is handled inside the task boundaries; only
/// configuration problems and unrecoverable runtime faults reach `main`,
/// where the variant decides the exit code.
#[derive(Error, Debug)]
pub enum FatalError {
    /// Bad or missing configuration, catalogue, or credentials. Exit code 1.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unrecoverable runtime fault (disk full, queue store corrupt). Exit code 2.
    #[error("fatal runtime error: {0}")]
    Runtime(String),

    /// The process was cancelled by signal. Exit code 130.
    #[error("cancelled by signal")]
    Cancelled,
}

impl FatalError {
    /// Exit code reported to the operating system.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Runtime(_) => 2,
            Self::Cancelled => 130,
        }
    }

    /// Wrap any error as a configuration failure.
    pub fn config(err: impl std::fmt::Display) -> Self {
        Self::Config(err.to_string())
    }

    /// Wrap any error as a runtime failure.
    pub fn runtime(err: impl std::fmt::Display) -> Self {
        Self::Runtime(err.to_string())
    }
}
