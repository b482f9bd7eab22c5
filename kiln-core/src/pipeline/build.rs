//! Image build pipeline.
//!
//! Drives the fixed step sequence that turns a template into an immutable
//! machine image on ephemeral compute. Steps execute in strict declared
//! order over shared pipeline state; the first failing step marks the result
//! failed and skips the rest. Instance release always runs, on every exit
//! path, using a scope independent of the caller's cancellation.

use crate::adapters::{
    CommandState, ComputeProvider, ImageRegistry, CommandExecutor, InstanceSpec,
};
use crate::config::BuilderConfig;
use crate::error::{BuildError, Result};
use crate::pipeline::{replicate::replicate_image, run_remote_command, validate};
use crate::types::build::{
    BuildRequest, BuildResult, BuildStatus, DRY_RUN_IMAGE, DRY_RUN_INSTANCE,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Builds machine images from templates.
///
/// Holds only read-only configuration and the injected platform ports, so a
/// single builder safely serves concurrent build and save invocations.
pub struct ImageBuilder {
    compute: Arc<dyn ComputeProvider>,
    executor: Arc<dyn CommandExecutor>,
    registry: Option<Arc<dyn ImageRegistry>>,
    config: BuilderConfig,
}

impl ImageBuilder {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        executor: Arc<dyn CommandExecutor>,
        registry: Option<Arc<dyn ImageRegistry>>,
        config: BuilderConfig,
    ) -> Self {
        Self { compute, executor, registry, config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub(crate) fn compute(&self) -> &Arc<dyn ComputeProvider> {
        &self.compute
    }

    pub(crate) fn registry(&self) -> Option<&Arc<dyn ImageRegistry>> {
        self.registry.as_ref()
    }

    /// Build an image from a template.
    ///
    /// Always returns the result, whatever happened: status, accumulated
    /// log, and the region map of any copies that did succeed. The typed
    /// error that aborted the pipeline, when one did, is returned alongside.
    #[instrument(skip(self, request), fields(template = %request.template_name, region = %request.region, dry_run = request.dry_run))]
    pub async fn build(&self, request: BuildRequest) -> (BuildResult, Option<BuildError>) {
        let mut pipeline = BuildPipeline::new(self, request);
        let failure = pipeline.run().await;

        let mut result = pipeline.result;
        result.duration = Some(pipeline.started.elapsed());
        result.finished_at = Some(Utc::now());
        match &failure {
            Some(err) => {
                result.status = BuildStatus::Failed;
                result.error_message = Some(err.to_string());
                error!(build_id = %result.build_id, error = %err, "build failed");
            }
            None => {
                // Dry runs already hold their terminal status.
                if result.status == BuildStatus::InProgress {
                    result.status = BuildStatus::Completed;
                }
                info!(
                    build_id = %result.build_id,
                    status = %result.status,
                    "build finished in {:.1}s",
                    pipeline.started.elapsed().as_secs_f64()
                );
            }
        }

        (result, failure)
    }
}

/// Ordered, non-final steps of the build pipeline. Instance release follows
/// unconditionally and is not skippable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildStep {
    Validate,
    ResolveBaseImage,
    ProvisionInstance,
    ExecuteBuildSteps,
    ExecuteValidationChecks,
    CaptureImage,
    ReplicateAcrossRegions,
}

impl BuildStep {
    const SEQUENCE: [BuildStep; 7] = [
        BuildStep::Validate,
        BuildStep::ResolveBaseImage,
        BuildStep::ProvisionInstance,
        BuildStep::ExecuteBuildSteps,
        BuildStep::ExecuteValidationChecks,
        BuildStep::CaptureImage,
        BuildStep::ReplicateAcrossRegions,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Validate => "validate request",
            Self::ResolveBaseImage => "resolve base image",
            Self::ProvisionInstance => "provision builder instance",
            Self::ExecuteBuildSteps => "execute build actions",
            Self::ExecuteValidationChecks => "run validation checks",
            Self::CaptureImage => "capture image",
            Self::ReplicateAcrossRegions => "replicate across regions",
        }
    }
}

/// Per-invocation pipeline state.
struct BuildPipeline<'a> {
    builder: &'a ImageBuilder,
    request: BuildRequest,
    result: BuildResult,
    instance: Option<ProvisionedInstance>,
    image_name: Option<String>,
    started: Instant,
}

impl<'a> BuildPipeline<'a> {
    fn new(builder: &'a ImageBuilder, request: BuildRequest) -> Self {
        let build_id = request
            .build_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..8].to_string());

        let mut result = BuildResult {
            build_id,
            template_name: request.template_name.clone(),
            region: request.region.clone(),
            architecture: request.architecture,
            status: BuildStatus::InProgress,
            source_image: None,
            image_id: None,
            copied_images: HashMap::new(),
            instance_id: None,
            version: request.version.clone(),
            error_message: None,
            log: String::new(),
            validation_log: None,
            finished_at: None,
            duration: None,
        };

        result.log.push_str(&format!("Build started at {}\n", Utc::now().to_rfc3339()));
        result.log.push_str(&format!("Template: {}\n", request.template_name));
        result.log.push_str(&format!("Architecture: {}\n", request.architecture));
        result.log.push_str(&format!("Region: {}\n\n", request.region));

        Self { builder, request, result, instance: None, image_name: None, started: Instant::now() }
    }

    async fn run(&mut self) -> Option<BuildError> {
        let mut failure = None;

        for step in BuildStep::SEQUENCE {
            info!(step = step.name(), "running build step");
            if let Err(err) = self.execute_step(step).await {
                self.log_line(&format!("{}: FAILED: {err}", step.name()));
                failure = Some(err);
                break;
            }
        }

        self.release_instance().await;
        failure
    }

    async fn execute_step(&mut self, step: BuildStep) -> Result<()> {
        match step {
            BuildStep::Validate => self.validate(),
            BuildStep::ResolveBaseImage => self.resolve_base_image(),
            BuildStep::ProvisionInstance => self.provision_instance().await,
            BuildStep::ExecuteBuildSteps => self.execute_build_actions().await,
            BuildStep::ExecuteValidationChecks => self.execute_validation_checks().await,
            BuildStep::CaptureImage => self.capture_image().await,
            BuildStep::ReplicateAcrossRegions => self.replicate().await,
        }
    }

    fn log_line(&mut self, line: &str) {
        self.result.log.push_str(line);
        self.result.log.push('\n');
    }

    fn validate(&mut self) -> Result<()> {
        self.builder.config.validate_region(&self.request.region)?;

        for region in &self.request.copy_to_regions {
            self.builder.config.validate_region(region).map_err(|err| {
                BuildError::validation("invalid target region for copying")
                    .with_context("region", region)
                    .with_source(err)
            })?;
        }

        self.log_line("request validated");
        Ok(())
    }

    fn resolve_base_image(&mut self) -> Result<()> {
        let image = self.builder.config.base_image(
            &self.request.template.base,
            &self.request.region,
            self.request.architecture,
        )?;
        self.log_line(&format!("base image: {image}"));
        self.result.source_image = Some(image);
        Ok(())
    }

    async fn provision_instance(&mut self) -> Result<()> {
        if self.request.dry_run {
            self.result.instance_id = Some(DRY_RUN_INSTANCE.to_string());
            self.log_line("dry run: skipping instance provisioning");
            return Ok(());
        }

        let subnet_id = self
            .request
            .subnet_id
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| self.builder.config.default_subnet.clone())
            .ok_or_else(|| {
                BuildError::validation("subnet is required for builder instances")
                    .with_context("template", &self.request.template_name)
            })?;

        let security_group = self.resolve_security_group().await?;

        let base_image = self
            .result
            .source_image
            .clone()
            .ok_or_else(|| BuildError::internal("base image was not resolved"))?;

        let mut tags = HashMap::new();
        tags.insert(
            "Name".to_string(),
            format!("image-builder-{}-{}", self.request.template_name, self.result.build_id),
        );
        tags.insert("kiln:build-id".to_string(), self.result.build_id.clone());
        tags.insert("kiln:template".to_string(), self.request.template_name.clone());

        let spec = InstanceSpec {
            image_id: base_image,
            shape: self.builder.config.instance_shape(self.request.architecture).to_string(),
            subnet_id,
            security_group,
            tags,
        };

        let instance_id = self.builder.compute.provision(&spec).await?;
        info!(instance_id = %instance_id, "builder instance launched");
        self.result.instance_id = Some(instance_id.clone());
        self.instance = Some(ProvisionedInstance::new(
            Arc::clone(&self.builder.compute),
            instance_id.clone(),
        ));
        self.log_line(&format!("builder instance: {instance_id}"));

        self.wait_instance_ready(&instance_id).await?;
        self.log_line("instance ready for build");
        Ok(())
    }

    /// Firewall grouping priority: request value, then configured default,
    /// then the platform's default for the network.
    async fn resolve_security_group(&self) -> Result<String> {
        if let Some(group) = self.request.security_group.clone().filter(|g| !g.is_empty()) {
            return Ok(group);
        }
        if let Some(group) = self.builder.config.default_security_group.clone() {
            return Ok(group);
        }

        let vpc_id = self
            .request
            .vpc_id
            .clone()
            .or_else(|| self.builder.config.default_vpc.clone())
            .unwrap_or_default();
        self.builder.compute.default_security_group(&vpc_id).await.map_err(|err| {
            BuildError::network("no security group specified and failed to find default")
                .with_context("vpc_id", &vpc_id)
                .with_source(err)
        })
    }

    /// Wait for the running hardware state, then poll the management agent
    /// until it reports online. The agent poll is bounded by attempt count,
    /// and exhausting it is a retryable error.
    async fn wait_instance_ready(&self, instance_id: &str) -> Result<()> {
        let waits = &self.builder.config.waits;

        self.builder.compute.wait_running(instance_id, waits.instance_running()).await?;

        for _ in 0..waits.agent_poll_attempts {
            match self.builder.executor.agent_online(instance_id).await {
                Ok(true) => return Ok(()),
                // The agent registers some time after boot; keep polling
                // through lookup failures.
                Ok(false) | Err(_) => {}
            }
            sleep(waits.agent_poll_interval()).await;
        }

        Err(BuildError::instance("timeout waiting for the management agent to come online")
            .retryable()
            .with_context("instance_id", instance_id))
    }

    async fn execute_build_actions(&mut self) -> Result<()> {
        let actions = self.request.template.build_steps.clone();
        self.log_line(&format!("executing {} build actions", actions.len()));

        for (index, action) in actions.iter().enumerate() {
            info!(action = %action.name, "build action {}/{}", index + 1, actions.len());

            if self.request.dry_run {
                self.log_line(&format!(
                    "[dry run] would execute '{}':\n{}",
                    action.name, action.script
                ));
                continue;
            }

            let instance_id = self
                .result
                .instance_id
                .clone()
                .ok_or_else(|| BuildError::internal("builder instance was not provisioned"))?;

            let action_timeout = action
                .timeout_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| self.builder.config.waits.command_timeout());

            let started = Instant::now();
            let status = run_remote_command(
                self.builder.executor.as_ref(),
                &instance_id,
                &action.script,
                action_timeout,
                self.builder.config.waits.command_poll_interval(),
            )
            .await
            .map_err(|err| err.with_context("action", &action.name))?;

            let elapsed = started.elapsed();
            match status.state {
                CommandState::Success => {
                    self.log_line(&format!(
                        "action '{}': SUCCESS ({:.1}s)\n{}",
                        action.name,
                        elapsed.as_secs_f64(),
                        status.stdout
                    ));
                }
                state => {
                    let detail = if status.stderr.is_empty() {
                        format!("command finished with state {state}")
                    } else {
                        status.stderr.clone()
                    };
                    self.log_line(&format!("action '{}': FAILED: {detail}", action.name));
                    return Err(BuildError::command(format!(
                        "build action '{}' failed: {detail}",
                        action.name
                    ))
                    .with_context("action", &action.name)
                    .with_context("state", state.to_string()));
                }
            }
        }

        Ok(())
    }

    async fn execute_validation_checks(&mut self) -> Result<()> {
        let checks = self.request.template.validation.clone();
        if checks.is_empty() {
            warn!("no validation checks declared, continuing");
            self.log_line("no validation checks declared");
            return Ok(());
        }

        if self.request.dry_run {
            self.log_line(&format!("[dry run] would run {} validation checks", checks.len()));
            return Ok(());
        }

        let instance_id = self
            .result
            .instance_id
            .clone()
            .ok_or_else(|| BuildError::internal("builder instance was not provisioned"))?;

        let waits = &self.builder.config.waits;
        let report = validate::run_checks(
            self.builder.executor.as_ref(),
            &instance_id,
            &checks,
            waits.check_timeout(),
            waits.command_poll_interval(),
        )
        .await;

        self.result.validation_log = Some(report.formatted());
        self.log_line(&report.summary());

        if !report.all_passed() {
            return Err(BuildError::validation("image validation failed")
                .with_context("passed", report.passed.to_string())
                .with_context("total", report.total.to_string()));
        }

        Ok(())
    }

    async fn capture_image(&mut self) -> Result<()> {
        if self.request.dry_run {
            self.result.status = BuildStatus::DryRunComplete;
            self.result.image_id = Some(DRY_RUN_IMAGE.to_string());
            self.log_line("dry run complete: skipping image capture");
            return Ok(());
        }

        let instance_id = self
            .result
            .instance_id
            .clone()
            .ok_or_else(|| BuildError::internal("builder instance was not provisioned"))?;

        let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let name = format!(
            "{}-{}-{}-{}",
            self.request.template_name, self.request.architecture, self.request.region, timestamp
        );
        let description = format!("kiln {} template", self.request.template_name);

        let mut tags = HashMap::new();
        tags.insert("Name".to_string(), name.clone());
        tags.insert("kiln:template".to_string(), self.request.template_name.clone());
        tags.insert("kiln:architecture".to_string(), self.request.architecture.to_string());
        tags.insert("kiln:build-id".to_string(), self.result.build_id.clone());
        tags.insert("kiln:build-date".to_string(), timestamp);
        tags.extend(self.request.template.tags.clone());

        let image_id =
            self.builder.compute.capture_image(&instance_id, &name, &description, tags).await?;
        info!(image_id = %image_id, "image capture started");
        self.log_line(&format!("image capture started: {image_id}"));
        self.result.image_id = Some(image_id.clone());
        self.image_name = Some(name);

        self.builder
            .compute
            .wait_image_available(
                &image_id,
                &self.request.region,
                self.builder.config.waits.image_available(),
            )
            .await?;
        self.log_line("image available");
        Ok(())
    }

    async fn replicate(&mut self) -> Result<()> {
        if self.request.dry_run || self.request.copy_to_regions.is_empty() {
            return Ok(());
        }

        let image_id = self
            .result
            .image_id
            .clone()
            .ok_or_else(|| BuildError::internal("image was not captured"))?;
        let name = self.image_name.clone().unwrap_or_else(|| image_id.clone());
        let description = format!(
            "kiln {} template (copied from {})",
            self.request.template_name, self.request.region
        );

        self.log_line(&format!(
            "copying image to {} regions",
            self.request.copy_to_regions.len()
        ));

        let (copied, failures) = replicate_image(
            Arc::clone(&self.builder.compute),
            &image_id,
            &format!("{name}-copy"),
            &description,
            &self.request.region,
            &self.request.copy_to_regions,
            self.builder.config.waits.image_available(),
        )
        .await;

        for (region, image) in &copied {
            self.log_line(&format!("copied to {region}: {image}"));
        }
        self.result.copied_images.extend(copied);

        if !failures.is_empty() {
            let summary = failures
                .iter()
                .map(|(region, err)| format!("{region}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            let regions = failures
                .iter()
                .map(|(region, _)| region.clone())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(BuildError::image_creation(format!(
                "some region copies failed: {summary}"
            ))
            .with_context("failed_regions", regions));
        }

        Ok(())
    }

    /// Final step, never skipped. Termination failures are logged, not
    /// escalated.
    async fn release_instance(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.log_line("releasing builder instance");
            instance.release().await;
        }
    }
}

/// Scoped ownership of a provisioned builder instance.
///
/// Release must survive a caller-side cancellation, so `Drop` falls back to
/// terminating from a detached task when `release` was never awaited.
pub(crate) struct ProvisionedInstance {
    compute: Arc<dyn ComputeProvider>,
    instance_id: String,
    released: bool,
}

impl ProvisionedInstance {
    pub(crate) fn new(compute: Arc<dyn ComputeProvider>, instance_id: String) -> Self {
        Self { compute, instance_id, released: false }
    }

    /// Terminate the instance. Failures are logged, never escalated.
    pub(crate) async fn release(mut self) {
        self.released = true;
        if let Err(err) = self.compute.terminate(&self.instance_id).await {
            warn!(instance_id = %self.instance_id, error = %err, "failed to terminate builder instance");
        }
    }
}

impl Drop for ProvisionedInstance {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let compute = Arc::clone(&self.compute);
        let instance_id = std::mem::take(&mut self.instance_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = compute.terminate(&instance_id).await {
                    warn!(instance_id = %instance_id, error = %err, "failed to terminate builder instance during cleanup");
                }
            });
        } else {
            warn!(instance_id = %instance_id, "no runtime available to terminate builder instance");
        }
    }
}
