//! Error types for rune-compose

use thiserror::Error;

/// Result type for compose operations
pub type Result<T> = std::result::Result<T, ComposeError>;

/// Compose error types
#[derive(Error, Debug)]
pub enum ComposeError {
    /// The descriptor could not be parsed or failed validation
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// The dependency graph contains at least one cycle
    #[error("Cyclic dependency between services: {}", .members.join(", "))]
    CyclicDependency { members: Vec<String> },

    /// A single service failed to launch
    #[error("Failed to launch service {service}: {cause}")]
    LaunchFailure { service: String, cause: String },

    /// A shared resource (volume or network) could not be provisioned
    #[error("Failed to provision {resource}: {cause}")]
    ProvisionFailure { resource: String, cause: String },

    /// A service was skipped because one of its dependencies never became ready
    #[error("Service {service} skipped: dependency {dependency} is not ready")]
    DependencyFailed { service: String, dependency: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Build error: {0}")]
    Build(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ComposeError {
    /// Shorthand for a malformed descriptor error
    pub fn malformed(message: impl Into<String>) -> Self {
        ComposeError::MalformedDescriptor(message.into())
    }

    /// Shorthand for a launch failure of `service`
    pub fn launch(service: &str, cause: impl std::fmt::Display) -> Self {
        ComposeError::LaunchFailure {
            service: service.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Shorthand for a provisioning failure of `resource`
    pub fn provision(resource: &str, cause: impl std::fmt::Display) -> Self {
        ComposeError::ProvisionFailure {
            resource: resource.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Whether retrying the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ComposeError::LaunchFailure { .. }
                | ComposeError::ProvisionFailure { .. }
                | ComposeError::Runtime(_)
                | ComposeError::Timeout(_)
                | ComposeError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cyclic_dependency_message_lists_members() {
        let err = ComposeError::CyclicDependency {
            members: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency between services: a, b");
    }

    #[test]
    fn test_validation_errors_are_not_retryable() {
        assert!(!ComposeError::malformed("bad").is_retryable());
        assert!(!ComposeError::CyclicDependency { members: vec![] }.is_retryable());
        assert!(ComposeError::launch("web", "boom").is_retryable());
        assert!(ComposeError::Runtime("engine unavailable".to_string()).is_retryable());
    }
}
