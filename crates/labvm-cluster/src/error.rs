//! Cluster and template error types.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors returned by a `ClusterClient`, tagged by the control plane's
/// verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// A workload with this name already exists (HTTP 409).
    #[error("workload already exists: {0}")]
    AlreadyExists(String),

    /// No workload with this name exists (HTTP 404).
    #[error("workload not found: {0}")]
    NotFound(String),

    /// Client construction or kubeconfig failure.
    #[error("cluster connection error: {0}")]
    Connect(String),

    /// Any other control-plane or transport failure.
    #[error("cluster error: {0}")]
    Other(String),
}

/// Errors raised while turning the manifest template into a Deployment.
///
/// Retrying never fixes these.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {message}")]
    Io { path: String, message: String },

    #[error("template does not compile: {0}")]
    Compile(String),

    #[error("template never references {{{{ vm_name }}}}")]
    MissingPlaceholder,

    #[error("template render failed: {0}")]
    Render(String),

    #[error("rendered manifest is not a valid Deployment: {0}")]
    Parse(String),

    #[error("rendered manifest is named {found:?}, expected {expected:?}")]
    NameMismatch {
        expected: String,
        found: Option<String>,
    },
}
