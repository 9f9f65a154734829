//! Core types for the instruction annotation library
//!
//! This module defines the error type shared by every component and the step outcome
//! that the dispatcher hands back to the exploration engine after an annotated
//! instruction has been processed.

use std::fmt;

/// Result type for annotation operations
pub type Result<T> = std::result::Result<T, AnnotationError>;

/// Identifier the exploration engine assigns to an execution state
pub type StateId = u64;

/// Errors that can occur while loading or dispatching annotations
///
/// Configuration and registration errors are fatal at initialization. Step termination and
/// function skip are not errors; they travel as [`StepOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum AnnotationError {
    #[error("Unknown calling convention: {0}")]
    UnknownConvention(String),

    #[error("No script callback bound to name: {0}")]
    MissingCallback(String),

    #[error("Fork failed: {0}")]
    Fork(String),

    #[error("Invalid trace: {0}")]
    InvalidTrace(String),

    #[error("Failed to parse trace: {0}")]
    TraceParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// What the exploration engine must do once an annotation has been processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[must_use]
pub enum StepOutcome {
    /// Keep executing the current step
    #[default]
    Continue,
    /// Abort the current step immediately; no further instruction of it executes
    Terminate,
}

impl StepOutcome {
    /// True if the current step must be aborted
    pub fn is_terminate(&self) -> bool {
        matches!(self, StepOutcome::Terminate)
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Continue => write!(f, "continue"),
            StepOutcome::Terminate => write!(f, "terminate"),
        }
    }
}
