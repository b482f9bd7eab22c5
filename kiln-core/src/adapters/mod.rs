//! Ports consumed by the resolver and the build pipelines.
//!
//! The core never talks to a cloud platform or a persistence layer directly.
//! Callers inject implementations of these traits (an EC2-backed compute
//! provider, an SSM-backed command executor, a parameter-store registry, a
//! file- or database-backed template store). Tests inject in-memory fakes.
//!
//! The store and registry are owned by the caller; the core performs no
//! locking over them. Serializing concurrent mutation of a shared store is
//! the caller's responsibility.

use crate::error::Result;
use crate::types::build::{Architecture, BuildResult};
use crate::types::template::{Template, TemplateMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Caller-owned template catalog.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Look up a template by name. Absent templates are an error.
    async fn get_template(&self, name: &str) -> Result<Template>;

    /// Version metadata the store keeps for a template, if any.
    async fn template_metadata(&self, name: &str) -> Option<TemplateMetadata>;

    /// Materialize a template into the store. Used when fetching missing
    /// dependencies from the registry.
    async fn insert_template(&self, template: Template, metadata: TemplateMetadata) -> Result<()>;
}

/// A template published to the shared registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedTemplateEntry {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub published_at: DateTime<Utc>,

    /// Serialized template definition.
    #[serde(default)]
    pub template_data: String,

    /// Serialization format of `template_data`, e.g. `json`.
    #[serde(default)]
    pub format: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Versioned catalog of shared templates and built images.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// All published versions of a template.
    async fn list_versions(&self, template_name: &str) -> Result<Vec<String>>;

    /// All shared templates, keyed by name.
    async fn list_shared_templates(&self) -> Result<HashMap<String, SharedTemplateEntry>>;

    /// A shared template at a specific version, or its latest when `version`
    /// is absent.
    async fn get_shared_template(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<SharedTemplateEntry>;

    /// Record a built image in the registry.
    async fn publish_image(&self, result: &BuildResult) -> Result<()>;

    /// Publish a serialized template definition.
    async fn publish_template(
        &self,
        name: &str,
        data: &str,
        format: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()>;
}

/// Specification for provisioning an ephemeral builder instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Base image to boot from.
    pub image_id: String,

    /// Compute shape, e.g. `t3.medium`.
    pub shape: String,

    pub subnet_id: String,
    pub security_group: String,

    /// Tags applied to the instance.
    pub tags: HashMap<String, String>,
}

/// Facts about an existing instance, used when saving it as an image.
#[derive(Debug, Clone)]
pub struct InstanceDescription {
    pub architecture: Architecture,
    pub region: String,
}

/// Ephemeral compute platform the pipelines orchestrate.
///
/// Waiters block until the watched resource reaches the requested state or
/// the timeout expires; expiry surfaces as a retryable error.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Launch a builder instance. Returns its reference.
    async fn provision(&self, spec: &InstanceSpec) -> Result<String>;

    /// Block until the instance reports a running hardware state.
    async fn wait_running(&self, instance_id: &str, timeout: Duration) -> Result<()>;

    /// Architecture and region of an existing instance.
    async fn describe(&self, instance_id: &str) -> Result<InstanceDescription>;

    /// Request an image snapshot of the instance. Returns the image
    /// reference; availability is waited on separately.
    async fn capture_image(
        &self,
        instance_id: &str,
        name: &str,
        description: &str,
        tags: HashMap<String, String>,
    ) -> Result<String>;

    /// Block until the image is available in `region`.
    async fn wait_image_available(
        &self,
        image_id: &str,
        region: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Copy an image to another region. Returns the new image reference in
    /// the target region.
    async fn copy_image(
        &self,
        image_id: &str,
        name: &str,
        description: &str,
        source_region: &str,
        target_region: &str,
    ) -> Result<String>;

    /// Stop the instance and wait until it reports stopped.
    async fn stop(&self, instance_id: &str) -> Result<()>;

    /// Start a stopped instance.
    async fn start(&self, instance_id: &str) -> Result<()>;

    /// Terminate the instance.
    async fn terminate(&self, instance_id: &str) -> Result<()>;

    /// Default firewall grouping of a network, used when neither the request
    /// nor the builder configuration names one.
    async fn default_security_group(&self, vpc_id: &str) -> Result<String>;
}

/// States a remote command moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    InProgress,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl CommandState {
    /// Whether the command has finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled | Self::TimedOut)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::InProgress => f.write_str("in_progress"),
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::TimedOut => f.write_str("timed_out"),
        }
    }
}

/// Observed state and captured output of a remote command.
#[derive(Debug, Clone)]
pub struct CommandStatus {
    pub state: CommandState,
    pub stdout: String,
    pub stderr: String,
}

impl CommandStatus {
    pub fn pending() -> Self {
        Self { state: CommandState::Pending, stdout: String::new(), stderr: String::new() }
    }
}

/// Remote command channel into builder instances.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Dispatch a script on the instance. Returns a command id for polling.
    async fn send(&self, instance_id: &str, script: &str, timeout: Duration) -> Result<String>;

    /// Current status of a previously sent command.
    async fn poll(&self, command_id: &str, instance_id: &str) -> Result<CommandStatus>;

    /// Whether the remote management agent on the instance is reachable.
    async fn agent_online(&self, instance_id: &str) -> Result<bool>;
}
