//! Error taxonomy for provenance operations.

use crate::model::SourceableRef;
use thiserror::Error;

pub type Result<T, E = ProvenanceError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ProvenanceError {
    /// The operation is not allowed by the type's registration, or the type is unknown.
    #[error("configuration error for {type_name}: {reason}")]
    Configuration { type_name: String, reason: String },

    /// A registry write would break the id-set invariant or lacks a required reference.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// At least one member of a batch failed; successful members stay applied.
    #[error("{failed} of {total} batch members failed")]
    PartialBatchFailure {
        failed: usize,
        total: usize,
        failures: Vec<BatchFailure>,
    },

    /// Backend failure, passed through untouched.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ProvenanceError {
    pub(crate) fn configuration(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn constraint(message: impl Into<String>) -> Self {
        Self::ConstraintViolation(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

/// One failed member of a batch operation
#[derive(Debug)]
pub struct BatchFailure {
    pub record: SourceableRef,
    pub error: ProvenanceError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_pass_through_unchanged() {
        let err: ProvenanceError = anyhow::anyhow!("connection reset").into();
        assert_eq!(err.to_string(), "connection reset");
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_partial_batch_failure_message() {
        let err = ProvenanceError::PartialBatchFailure {
            failed: 1,
            total: 3,
            failures: vec![BatchFailure {
                record: SourceableRef::new("SourceableRecord", 2),
                error: ProvenanceError::constraint("boom"),
            }],
        };
        assert_eq!(err.to_string(), "1 of 3 batch members failed");
    }
}
