//! Error taxonomy for the control plane
//!
//! Kinds map one-to-one onto the wire behavior: validation failures are
//! client errors and never retried, not-found drives agent re-registration,
//! transient/timeout feed the proxy's breaker counters, and circuit-open
//! is surfaced without counting toward further breaker failures.

use thiserror::Error;

/// Control-plane error kinds
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Instance is bound to service '{existing}', cannot rebind to '{requested}'")]
    ServiceBindingChanged { existing: String, requested: String },

    #[error("Transient network failure: {0}")]
    Transient(String),

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Stable wire identifier for the error kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::ServiceBindingChanged { .. } => "service_binding_changed",
            Self::Transient(_) => "transient",
            Self::Timeout(_) => "timeout",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status the kind surfaces as
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::ServiceBindingChanged { .. } => 400,
            Self::NotFound(_) => 404,
            Self::Transient(_) => 502,
            Self::CircuitOpen(_) => 503,
            Self::Timeout(_) => 504,
            Self::Internal(_) => 500,
        }
    }

    /// Whether a caller may retry the operation at its natural scope
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_) | Self::Internal(_))
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::Transient(err.to_string())
        } else {
            Self::Internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(MeshError::Validation("x".into()).status_code(), 400);
        assert_eq!(MeshError::NotFound("x".into()).status_code(), 404);
        assert_eq!(MeshError::Transient("x".into()).status_code(), 502);
        assert_eq!(MeshError::CircuitOpen("x".into()).status_code(), 503);
        assert_eq!(MeshError::Timeout("x".into()).status_code(), 504);
        assert_eq!(MeshError::Internal("x".into()).status_code(), 500);
        assert_eq!(
            MeshError::ServiceBindingChanged {
                existing: "a".into(),
                requested: "b".into()
            }
            .status_code(),
            400
        );
    }

    #[test]
    fn validation_is_never_retryable() {
        assert!(!MeshError::Validation("x".into()).is_retryable());
        assert!(!MeshError::CircuitOpen("x".into()).is_retryable());
        assert!(MeshError::Transient("x".into()).is_retryable());
        assert!(MeshError::Timeout("x".into()).is_retryable());
    }
}
