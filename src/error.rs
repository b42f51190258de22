//! Error types for the reconciliation core.
//!
//! Every variant maps to one failure class of a reconcile call. The core never
//! retries on its own; the controller's error policy turns these into requeues.

use crate::config::RequeueConfig;
use crate::image_reference::ParseError;
use crate::oci_registry::RegistryError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// REGISTRY_USERNAME or REGISTRY_PASSWORD is unset or empty
    #[error("registry username or password cannot be empty")]
    CredentialsMissing,

    #[error("invalid image reference {reference}: {source}")]
    InvalidReference {
        reference: String,
        #[source]
        source: ParseError,
    },

    #[error("failed to resolve destination image for {image}: {source}")]
    ResolutionFailed {
        image: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to fetch source image {reference}: {source}")]
    SourceFetchFailed {
        reference: String,
        #[source]
        source: RegistryError,
    },

    #[error("failed to push image {reference}: {source}")]
    PushFailed {
        reference: String,
        #[source]
        source: RegistryError,
    },

    /// The object changed between fetch and update (HTTP 409)
    #[error("{kind} {namespace}/{name} was modified concurrently")]
    UpdateConflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("operation cancelled by shutdown")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether redelivering the same request can succeed without operator intervention
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::CredentialsMissing | Error::InvalidReference { .. } => false,
            Error::ResolutionFailed { source, .. } => source.is_retriable(),
            Error::SourceFetchFailed { .. }
            | Error::PushFailed { .. }
            | Error::UpdateConflict { .. }
            | Error::Kube(_)
            | Error::Cancelled => true,
        }
    }

    pub fn requeue_after(&self, requeue: &RequeueConfig) -> Duration {
        let seconds = match self {
            Error::UpdateConflict { .. } => requeue.conflict_seconds,
            _ if self.is_retriable() => requeue.transient_seconds,
            _ => requeue.permanent_seconds,
        };
        Duration::from_secs(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_failure_inherits_retriability() {
        let err = Error::ResolutionFailed {
            image: "nginx".to_string(),
            source: Box::new(Error::CredentialsMissing),
        };
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_requeue_delays() {
        let requeue = RequeueConfig::default();
        let conflict = Error::UpdateConflict {
            kind: "Deployment",
            namespace: "default".to_string(),
            name: "web".to_string(),
        };
        assert_eq!(
            conflict.requeue_after(&requeue),
            Duration::from_secs(requeue.conflict_seconds)
        );
        assert_eq!(
            Error::CredentialsMissing.requeue_after(&requeue),
            Duration::from_secs(requeue.permanent_seconds)
        );
        assert_eq!(
            Error::Cancelled.requeue_after(&requeue),
            Duration::from_secs(requeue.transient_seconds)
        );
    }
}
