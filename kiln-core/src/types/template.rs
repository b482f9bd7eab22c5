//! Template domain types.
//!
//! A template is a declarative build recipe: the base image family to start
//! from, ordered build actions, validation checks, and dependencies on other
//! templates. Parsing template files into these types is the caller's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Declarative build recipe for a machine image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Template {
    /// Template name, unique within a store.
    pub name: String,

    /// Base image family this template builds on (resolved against the
    /// builder's base-image catalog).
    #[serde(default)]
    pub base: String,

    #[serde(default)]
    pub description: String,

    /// Ordered build actions executed on the builder instance.
    #[serde(default)]
    pub build_steps: Vec<BuildAction>,

    /// Checks run on the builder instance after the build actions.
    #[serde(default)]
    pub validation: Vec<ValidationCheck>,

    /// Free-form tags propagated to built images.
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Minimum root disk size in GB.
    #[serde(default)]
    pub min_disk_gb: Option<u32>,

    /// Restrict the template to one architecture. Both when absent.
    #[serde(default)]
    pub architecture: Option<String>,

    /// Dependencies on other templates.
    #[serde(default)]
    pub dependencies: Vec<TemplateDependency>,
}

/// A single step in the image build process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAction {
    pub name: String,

    /// Shell script dispatched to the builder instance.
    pub script: String,

    /// Per-action timeout in seconds. Defaults to the builder's command
    /// timeout when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A check that validates the built image before capture.
///
/// At least one of the three modes should be set; a check with none falls
/// back to requiring a successful exit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,

    /// Command executed on the builder instance.
    pub command: String,

    /// Command must finish successfully.
    #[serde(default)]
    pub expect_success: bool,

    /// Output must contain this string.
    #[serde(default)]
    pub contains: Option<String>,

    /// Output must exactly match this string (surrounding whitespace
    /// ignored).
    #[serde(default)]
    pub equals: Option<String>,
}

/// Declared dependency on another template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateDependency {
    /// Name of the target template.
    pub name: String,

    /// Version constraint, e.g. `"1.2.0"`. Unconstrained when absent.
    #[serde(default)]
    pub version: Option<String>,

    /// Constraint operator. `>=` when absent.
    #[serde(default)]
    pub operator: Option<String>,

    /// Optional dependencies never fail resolution; their status is
    /// recorded and resolution continues.
    #[serde(default)]
    pub optional: bool,
}

/// Version metadata a store keeps alongside a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMetadata {
    /// Published semantic version, if any.
    #[serde(default)]
    pub version: Option<String>,

    pub last_modified: DateTime<Utc>,

    /// Provenance of the template, e.g. `registry://name` for fetched ones.
    #[serde(default)]
    pub source_url: Option<String>,
}

impl TemplateMetadata {
    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            last_modified: Utc::now(),
            source_url: None,
        }
    }
}
