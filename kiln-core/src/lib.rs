//! Kiln core library.
//!
//! Shared types, ports, and the two engines of the kiln image bakery:
//! semantic-version dependency resolution across templates, and the build
//! pipelines that turn templates into immutable machine images on ephemeral
//! remote compute.

pub mod adapters;
pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod resolver;
pub mod types;
pub mod version;

// Re-export commonly used items
pub use config::{BuilderConfig, WaitSettings};
pub use error::{BuildError, ErrorKind, Result};
pub use pipeline::{ImageBuilder, ValidationReport};
pub use resolver::{DependencyResolver, DependencyStatus, Resolution, ResolvedDependency};
pub use types::{
    Architecture, BuildRequest, BuildResult, BuildStatus, SaveInstanceRequest, Template,
};
pub use version::{ConstraintOp, VersionInfo};
