use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::unit::UnitStatus;

/// Unified error type for the convoy library.
///
/// Every variant is cloneable: a single failure is stored on its unit,
/// carried by the `Error` signal, and returned to each waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ConvoyError {
    /// A wrapped action raised inside a unit
    #[error("action failed in unit '{description}' ({unit}): {message}")]
    Action {
        unit: String,
        description: String,
        message: String,
    },

    /// Structural misuse: mutating the queue of a scope that already settled
    #[error("queue of '{description}' is sealed: scope is {status:?}")]
    Sealed {
        description: String,
        status: UnitStatus,
    },

    /// Structural misuse: entities are single-use
    #[error("unit '{description}' was already started")]
    AlreadyStarted { description: String },

    /// Invalid construction options
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ConvoyError {
    /// Create an action failure from whatever the action raised
    pub fn action<U: Into<String>, D: Into<String>>(
        unit: U,
        description: D,
        source: anyhow::Error,
    ) -> Self {
        Self::Action {
            unit: unit.into(),
            description: description.into(),
            // `{:#}` keeps the context chain in one line
            message: format!("{:#}", source),
        }
    }

    /// Create a sealed-queue error
    pub fn sealed<D: Into<String>>(description: D, status: UnitStatus) -> Self {
        Self::Sealed {
            description: description.into(),
            status,
        }
    }

    /// Create an already-started error
    pub fn already_started<D: Into<String>>(description: D) -> Self {
        Self::AlreadyStarted {
            description: description.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<M: Into<String>>(message: M) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<M: Into<String>>(message: M) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Structural errors are raised synchronously at the call site and never
    /// mark a unit as failed
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Sealed { .. } | Self::AlreadyStarted { .. })
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Action { .. } => "action",
            Self::Sealed { .. } => "sealed",
            Self::AlreadyStarted { .. } => "already_started",
            Self::Configuration { .. } => "configuration",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConvoyError>;
