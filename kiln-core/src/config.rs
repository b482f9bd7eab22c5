//! Builder configuration.

use crate::error::{BuildError, Result};
use crate::types::build::Architecture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Static configuration for an [`ImageBuilder`](crate::pipeline::ImageBuilder).
///
/// Holds the network defaults, the compute shapes per architecture, the
/// base-image catalog, and every wait ceiling the pipelines honor. The
/// builder only reads it, so one config can serve concurrent builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Fallback network placement when the request leaves it unset.
    pub default_vpc: Option<String>,
    pub default_subnet: Option<String>,
    pub default_security_group: Option<String>,

    /// Compute shape for x86_64 builder instances.
    pub x86_instance_shape: String,

    /// Compute shape for arm64 builder instances.
    pub arm64_instance_shape: String,

    /// Base-image catalog: region to base-name to image reference.
    ///
    /// arm64 builds first try the `<base>-arm64` key and fall back to the
    /// plain base name.
    pub base_images: HashMap<String, HashMap<String, String>>,

    pub waits: WaitSettings,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            default_vpc: None,
            default_subnet: None,
            default_security_group: None,
            x86_instance_shape: "t3.medium".to_string(),
            arm64_instance_shape: "t4g.medium".to_string(),
            base_images: builtin_base_images(),
            waits: WaitSettings::default(),
        }
    }
}

impl BuilderConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::validation(format!("failed to read config: {e}"))
                .with_context("path", path.to_string_lossy())
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BuildError::validation(format!("failed to parse config: {e}"))
                .with_context("path", path.to_string_lossy())
        })
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            BuildError::internal(format!("failed to serialize config: {e}"))
        })?;
        std::fs::write(path, content).map_err(|e| {
            BuildError::internal(format!("failed to write config: {e}"))
                .with_context("path", path.to_string_lossy())
        })
    }

    /// Regions the base-image catalog covers, sorted.
    pub fn supported_regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = self.base_images.keys().cloned().collect();
        regions.sort();
        regions
    }

    /// Fail unless the region appears in the base-image catalog.
    pub fn validate_region(&self, region: &str) -> Result<()> {
        if !self.base_images.contains_key(region) {
            return Err(BuildError::validation(format!(
                "region {region} is not supported; supported regions: {}",
                self.supported_regions().join(", ")
            ))
            .with_context("region", region));
        }
        Ok(())
    }

    /// Resolve a base-image family to a concrete image reference.
    pub fn base_image(
        &self,
        base: &str,
        region: &str,
        architecture: Architecture,
    ) -> Result<String> {
        let region_images = self.base_images.get(region).ok_or_else(|| {
            BuildError::validation(format!(
                "no base images defined for region {region}; supported regions: {}",
                self.supported_regions().join(", ")
            ))
            .with_context("region", region)
        })?;

        let key = match architecture {
            Architecture::Arm64 => {
                let suffixed = format!("{base}-arm64");
                if region_images.contains_key(&suffixed) {
                    suffixed
                } else {
                    base.to_string()
                }
            }
            Architecture::X86_64 => base.to_string(),
        };

        region_images.get(&key).cloned().ok_or_else(|| {
            BuildError::validation(format!("no base image for '{base}' in region {region}"))
                .with_context("base", base)
                .with_context("region", region)
                .with_context("architecture", architecture.to_string())
        })
    }

    /// Compute shape for the requested architecture.
    pub fn instance_shape(&self, architecture: Architecture) -> &str {
        match architecture {
            Architecture::X86_64 => &self.x86_instance_shape,
            Architecture::Arm64 => &self.arm64_instance_shape,
        }
    }
}

/// Wait ceilings and poll intervals for every remote-state wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitSettings {
    /// Ceiling for the instance to reach a running hardware state.
    pub instance_running_secs: u64,

    /// Interval between management-agent reachability polls.
    pub agent_poll_interval_secs: u64,

    /// Number of agent polls before giving up.
    pub agent_poll_attempts: u32,

    /// Interval between remote-command status polls.
    pub command_poll_interval_secs: u64,

    /// Default per-action command timeout.
    pub command_timeout_secs: u64,

    /// Per-check timeout for validation commands.
    pub check_timeout_secs: u64,

    /// Ceiling for a captured or copied image to become available.
    pub image_available_secs: u64,

    /// Ceiling for an instance restart after a save.
    pub restart_wait_secs: u64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            instance_running_secs: 300,
            agent_poll_interval_secs: 10,
            agent_poll_attempts: 30,
            command_poll_interval_secs: 5,
            command_timeout_secs: 600,
            check_timeout_secs: 60,
            image_available_secs: 1800,
            restart_wait_secs: 180,
        }
    }
}

impl WaitSettings {
    pub fn instance_running(&self) -> Duration {
        Duration::from_secs(self.instance_running_secs)
    }

    pub fn agent_poll_interval(&self) -> Duration {
        Duration::from_secs(self.agent_poll_interval_secs)
    }

    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_secs(self.command_poll_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn image_available(&self) -> Duration {
        Duration::from_secs(self.image_available_secs)
    }

    pub fn restart_wait(&self) -> Duration {
        Duration::from_secs(self.restart_wait_secs)
    }
}

/// Builtin base-image catalog covering the stock regions.
pub fn builtin_base_images() -> HashMap<String, HashMap<String, String>> {
    let entries: [(&str, &str, &str); 8] = [
        ("us-east-1", "ami-02029c87fa31fb148", "ami-050499786ebf55a6a"),
        ("us-east-2", "ami-0574da8cbe4a3a80a", "ami-0960ab2a240c27ff3"),
        ("us-west-1", "ami-085a8d7b63d031cba", "ami-0a0a5204d8d741180"),
        ("us-west-2", "ami-016d360a89daa11ba", "ami-09f6c9efbf93542be"),
        ("eu-west-1", "ami-0694d931cee3dc7bb", "ami-0a1b0de9ee4ddd0a5"),
        ("eu-central-1", "ami-0faab6bdbac9486fb", "ami-064334c2008d4f9cd"),
        ("ap-northeast-1", "ami-0ffac9ed219ecde9d", "ami-0a3de148326a5527d"),
        ("ap-southeast-1", "ami-078c1149e8a47c0f0", "ami-026a9429bd57a973a"),
    ];

    entries
        .into_iter()
        .map(|(region, x86, arm)| {
            let mut images = HashMap::new();
            images.insert("ubuntu-22.04-server-lts".to_string(), x86.to_string());
            images.insert("ubuntu-22.04-server-lts-arm64".to_string(), arm.to_string());
            (region.to_string(), images)
        })
        .collect()
}
