use thiserror::Error;

use crate::resources::ResourceAmount;
use crate::trial::{TrialId, TrialStatus};

/// Main error type for the Tunewell system
#[derive(Error, Debug)]
pub enum TwError {
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Resource admission errors
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Request can never be satisfied: requires {requested} {resource}, cluster total is {capacity}")]
    CapacityExceeded {
        resource: String,
        requested: ResourceAmount,
        capacity: ResourceAmount,
    },

    #[error("Request {request} is not ready to be committed")]
    NotReady { request: u64 },

    #[error("Unknown resource request: {request}")]
    UnknownRequest { request: u64 },

    #[error("Invalid resource request: {message}")]
    InvalidRequest { message: String },
}

/// Trial lifecycle errors
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Trial {trial} cannot move from {from} to {to}")]
    InvalidTransition {
        trial: TrialId,
        from: TrialStatus,
        to: TrialStatus,
    },

    #[error("Cannot update resources of trial {trial} while it is {status}; pause it first")]
    ResizeNotAllowed { trial: TrialId, status: TrialStatus },

    #[error("Trial not found: {trial}")]
    NotFound { trial: TrialId },

    #[error("Trial {trial} failed: {message}")]
    ExecutionFailed { trial: TrialId, message: String },

    #[error("Unknown trainable: {name}")]
    UnknownTrainable { name: String },
}

/// Trial runner usage errors
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Called step() on a finished trial runner")]
    AlreadyFinished,
}

/// Result type alias for Tunewell operations
pub type TwResult<T> = Result<T, TwError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::TwError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TwError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TwError::Config(format!($($arg)*))
    };
}
