//! Domain types shared across the resolver and build pipelines.

pub mod build;
pub mod template;

pub use build::{
    Architecture, BuildRequest, BuildResult, BuildStatus, SaveInstanceRequest, DRY_RUN_IMAGE,
    DRY_RUN_INSTANCE,
};
pub use template::{
    BuildAction, Template, TemplateDependency, TemplateMetadata, ValidationCheck,
};
