//! Build request and result types.

use crate::types::template::Template;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Placeholder instance reference used by dry-run builds.
pub const DRY_RUN_INSTANCE: &str = "i-dry-run";

/// Placeholder image reference used by dry-run builds.
pub const DRY_RUN_IMAGE: &str = "image-dry-run";

/// CPU architecture of a builder instance and the image it produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => f.write_str("x86_64"),
            Self::Arm64 => f.write_str("arm64"),
        }
    }
}

/// Parameters for building an image from a template.
///
/// Owned by the caller; the pipeline only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub template_name: String,
    pub template: Template,

    /// Region the builder instance runs in and the image lands in.
    pub region: String,

    #[serde(default)]
    pub architecture: Architecture,

    /// Semantic version recorded on the produced image.
    #[serde(default)]
    pub version: Option<String>,

    /// Validate and log without touching the compute platform.
    #[serde(default)]
    pub dry_run: bool,

    /// Caller-supplied build id. Generated when absent.
    #[serde(default)]
    pub build_id: Option<String>,

    // Network placement for the builder instance.
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub security_group: Option<String>,

    /// Regions to replicate the image to after building.
    #[serde(default)]
    pub copy_to_regions: Vec<String>,
}

/// Parameters for saving a running instance as a new template image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveInstanceRequest {
    /// Instance to capture.
    pub instance_id: String,

    /// Human-readable name of the instance, recorded in provenance tags.
    pub instance_name: String,

    /// Name of the template the capture becomes.
    pub template_name: String,

    #[serde(default)]
    pub description: String,

    /// Regions to replicate the captured image to.
    #[serde(default)]
    pub copy_to_regions: Vec<String>,

    /// Extra tags applied to the captured image.
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Terminal and in-flight states of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    InProgress,
    Completed,
    Failed,
    DryRunComplete,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => f.write_str("in_progress"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::DryRunComplete => f.write_str("dry_run_complete"),
        }
    }
}

/// Outcome of a build or save-instance pipeline.
///
/// Created when the pipeline starts, mutated in place by each step, and
/// frozen once the pipeline returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub build_id: String,
    pub template_name: String,
    pub region: String,
    pub architecture: Architecture,
    pub status: BuildStatus,

    /// Base image the build started from.
    #[serde(default)]
    pub source_image: Option<String>,

    /// Image produced in the build region.
    #[serde(default)]
    pub image_id: Option<String>,

    /// Region to image-reference map of successful copies.
    #[serde(default)]
    pub copied_images: HashMap<String, String>,

    /// Builder instance the image was captured from.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Semantic version recorded on the image.
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Accumulated build log.
    #[serde(default)]
    pub log: String,

    /// Formatted validation outcome, when checks ran.
    #[serde(default)]
    pub validation_log: Option<String>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub duration: Option<Duration>,
}

impl BuildResult {
    /// Whether the pipeline reached a successful terminal state.
    pub fn is_successful(&self) -> bool {
        matches!(self.status, BuildStatus::Completed | BuildStatus::DryRunComplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_display() {
        assert_eq!(Architecture::X86_64.to_string(), "x86_64");
        assert_eq!(Architecture::Arm64.to_string(), "arm64");
    }

    #[test]
    fn status_display_matches_serde() {
        for (status, expected) in [
            (BuildStatus::InProgress, "in_progress"),
            (BuildStatus::Completed, "completed"),
            (BuildStatus::Failed, "failed"),
            (BuildStatus::DryRunComplete, "dry_run_complete"),
        ] {
            assert_eq!(status.to_string(), expected);
            assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{expected}\""));
        }
    }
}
