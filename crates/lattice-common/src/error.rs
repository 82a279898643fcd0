//! Error types shared by Lattice controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants carry the name of the resource being reconciled where one is
//! known, so log lines and status messages point at the right object.

use thiserror::Error;

/// Main error type for Lattice operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.maxSize")
        field: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client")
        context: String,
    },
}

impl Error {
    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a policy with a bad maxSize is rejected with a pointer to the field
    #[test]
    fn story_validation_points_at_the_offending_field() {
        let err = Error::validation_for_field("VolumeAutoscaler", "spec.maxSize", "must be positive");
        assert_eq!(
            err.to_string(),
            "validation error for VolumeAutoscaler: must be positive"
        );
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.maxSize"));
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    #[test]
    fn internal_errors_name_their_context() {
        let err = Error::internal_with_context("create_client", "failed to infer config");
        assert_eq!(
            err.to_string(),
            "internal error [create_client]: failed to infer config"
        );
    }

    #[test]
    fn kube_errors_convert_with_source() {
        let err: Error = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        })
        .into();
        assert!(matches!(err, Error::Kube { .. }));
        assert!(err.to_string().starts_with("kubernetes error:"));
    }
}
