//! Typed errors for the orchestrator API surface
//!
//! The HTTP/CLI layer sits outside this crate, so lifecycle operations report
//! failures through this enum rather than framework response types.

use thiserror::Error;

/// Errors surfaced by lifecycle operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The service id is not present in the registry
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The container engine rejected or failed the launch
    #[error("failed to launch service '{id}': {source}")]
    LaunchFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The container engine rejected or failed the stop
    #[error("failed to stop service '{id}': {source}")]
    StopFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A restart was aborted because the stop step failed; no new container
    /// is started on top of one in unknown state
    #[error("restart of service '{id}' aborted: {source}")]
    RestartAborted {
        id: String,
        #[source]
        source: Box<OrchestratorError>,
    },

    /// An adapter call exceeded its bounded timeout
    #[error("operation on service '{id}' timed out after {seconds}s")]
    Timeout { id: String, seconds: u64 },
}

impl OrchestratorError {
    /// The id of the service the error refers to
    pub fn service_id(&self) -> &str {
        match self {
            OrchestratorError::UnknownService(id) => id,
            OrchestratorError::LaunchFailed { id, .. } => id,
            OrchestratorError::StopFailed { id, .. } => id,
            OrchestratorError::RestartAborted { id, .. } => id,
            OrchestratorError::Timeout { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::UnknownService("web1".to_string());
        assert_eq!(err.to_string(), "unknown service: web1");

        let err = OrchestratorError::Timeout {
            id: "db1".to_string(),
            seconds: 30,
        };
        assert_eq!(err.to_string(), "operation on service 'db1' timed out after 30s");
    }

    #[test]
    fn test_service_id_accessor() {
        let inner = OrchestratorError::StopFailed {
            id: "db1".to_string(),
            source: anyhow::anyhow!("engine unreachable"),
        };
        let err = OrchestratorError::RestartAborted {
            id: "db1".to_string(),
            source: Box::new(inner),
        };
        assert_eq!(err.service_id(), "db1");
        assert!(err.to_string().contains("restart of service 'db1' aborted"));
    }
}
