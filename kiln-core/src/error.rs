//! Error types for kiln.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. Every error carries a failure category, a retryable flag telling
//! the caller whether re-invoking the operation is safe without extra
//! cleanup, and free-form context key-values for diagnostics.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Failure category of a [`BuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Request or template validation failed.
    Validation,

    /// Builder instance lifecycle operation failed.
    Instance,

    /// Remote command dispatch or execution failed.
    Command,

    /// Image capture or region copy failed.
    ImageCreation,

    /// Network placement (subnet, security group) could not be resolved.
    Network,

    /// Registry lookup or publish failed.
    Registry,

    /// Template dependency could not be resolved.
    Dependency,

    /// Dependency expansion found a cycle.
    CircularDependency,

    /// Unexpected internal error.
    Internal,
}

impl ErrorKind {
    /// Stable string form used in logs and error context.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Instance => "instance",
            Self::Command => "command",
            Self::ImageCreation => "image_creation",
            Self::Network => "network",
            Self::Registry => "registry",
            Self::Dependency => "dependency",
            Self::CircularDependency => "circular_dependency",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by the dependency resolver or a build pipeline.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct BuildError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    retryable: bool,
    context: BTreeMap<String, String>,
}

impl BuildError {
    /// Create an error of the given kind. Not retryable by default.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            retryable: false,
            context: BTreeMap::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn instance(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Instance, message)
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Command, message)
    }

    pub fn image_creation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ImageCreation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn registry(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Registry, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dependency, message)
    }

    pub fn circular_dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircularDependency, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attach a diagnostic key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.context.insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    /// Mark the error as safe to retry without additional cleanup.
    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }
}

impl From<anyhow::Error> for BuildError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string()).with_source(err)
    }
}
