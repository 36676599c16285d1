//! Error types for the CellVM hardware abstraction.

use thiserror::Error;

/// Errors raised by any `Hardware` backend.
///
/// Every variant is fatal for the operation that raised it. Backends never
/// retry and never patch state to make an error go away; the orchestrating
/// caller decides what happens next.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    /// Death ledger no longer sums to `1 - viability`.
    #[error(
        "Conservation violated for vessel {vessel_id} ({scope}): ledger sum {ledger_sum:.9} != 1 - viability {expected:.9}"
    )]
    ConservationViolation {
        vessel_id: String,
        scope: String,
        ledger_sum: f64,
        expected: f64,
    },

    /// A lethal exposure reached the death engine without a sampled delay.
    #[error("Missing commitment delay for vessel {vessel_id}, subpopulation {subpopulation}, compound {compound_id}")]
    MissingCommitmentDelay {
        vessel_id: String,
        subpopulation: String,
        compound_id: String,
    },

    /// Vessel id already in use
    #[error("Duplicate vessel: {0}")]
    DuplicateVessel(String),

    /// Vessel id not known to the backend
    #[error("Unknown vessel: {0}")]
    UnknownVessel(String),

    /// Out-of-range or malformed input rejected at the operation boundary
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// An assay changed biological state.
    #[error("Assay {assay} mutated vessel {vessel_id} (max difference {max_difference:e})")]
    AssayMutation {
        vessel_id: String,
        assay: String,
        max_difference: f64,
    },

    /// Parameter table or configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),
}

impl VmError {
    /// Creates an invalid-parameter error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Creates an unknown-vessel error.
    pub fn unknown_vessel(vessel_id: impl std::fmt::Display) -> Self {
        Self::UnknownVessel(vessel_id.to_string())
    }

    /// Creates a duplicate-vessel error.
    pub fn duplicate_vessel(vessel_id: impl std::fmt::Display) -> Self {
        Self::DuplicateVessel(vessel_id.to_string())
    }

    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Short machine-readable kind, used in operation records and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConservationViolation { .. } => "conservation_violation",
            Self::MissingCommitmentDelay { .. } => "missing_commitment_delay",
            Self::DuplicateVessel(_) => "duplicate_vessel",
            Self::UnknownVessel(_) => "unknown_vessel",
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::AssayMutation { .. } => "assay_mutation",
            Self::Config(_) => "config",
        }
    }
}
