use thiserror::Error;

use crate::probes::ProbeState;

/// A configuration value could not be converted to the declared type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot bind argument {field}: expected {expected}, got {actual}")]
pub struct ArgBindingError {
    /// Field or key name; sequence elements are reported as `Field[index]`.
    pub field: String,
    pub expected: String,
    pub actual: String,
}

/// Recoverable errors returned by the dispatcher and the probe lifecycle.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("undefined probe {0}")]
    UnknownProbe(String),

    #[error(transparent)]
    ArgBinding(#[from] ArgBindingError),

    #[error("failed to create probe {name}: {source:#}")]
    Construction {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("probe {name} failed: {source:#}")]
    Lifecycle {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("probe {name} is {state}")]
    InvalidState { name: String, state: ProbeState },
}

impl ProbeError {
    /// Short label used as a metric attribute.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::UnknownProbe(_) => "unknown_probe",
            ProbeError::ArgBinding(_) => "arg_binding",
            ProbeError::Construction { .. } => "construction",
            ProbeError::Lifecycle { .. } => "lifecycle",
            ProbeError::InvalidState { .. } => "invalid_state",
        }
    }
}

/// Integration errors detected while registering probes.
///
/// [`crate::probes::RegistryBuilder::must_register`] turns these into a panic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("probe name must not be empty")]
    EmptyName,

    #[error("duplicated event probe {0}")]
    Duplicate(String),

    #[error("error register event probe {name}: {reason}")]
    InvalidShape { name: String, reason: String },

    #[error("process-wide probe registry is already installed")]
    AlreadyInstalled,
}
