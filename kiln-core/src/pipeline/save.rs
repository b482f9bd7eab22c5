//! Save-running-instance pipeline.
//!
//! Converts a live instance into a new template image: capture instance
//! metadata, stop it for a crash-consistent snapshot, capture and replicate
//! the image, materialize a template definition describing it, and publish
//! to the registry. The original instance is restarted best-effort at the
//! end regardless of any earlier step's outcome.

use crate::error::{BuildError, Result};
use crate::pipeline::build::ImageBuilder;
use crate::pipeline::replicate::replicate_image;
use crate::types::build::{BuildResult, BuildStatus, SaveInstanceRequest};
use crate::types::template::Template;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Serialized artifact describing a saved-instance template and the images
/// backing it per region and architecture.
#[derive(Debug, Serialize)]
struct TemplateDefinition<'a> {
    template: &'a Template,
    images: HashMap<String, HashMap<String, String>>,
}

/// Ordered steps of the save pipeline. The instance restart follows
/// unconditionally and is not part of the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveStep {
    CaptureMetadata,
    StopInstance,
    CaptureImage,
    ReplicateAcrossRegions,
    MaterializeTemplate,
    PublishToRegistry,
}

impl SaveStep {
    const SEQUENCE: [SaveStep; 6] = [
        SaveStep::CaptureMetadata,
        SaveStep::StopInstance,
        SaveStep::CaptureImage,
        SaveStep::ReplicateAcrossRegions,
        SaveStep::MaterializeTemplate,
        SaveStep::PublishToRegistry,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::CaptureMetadata => "capture instance metadata",
            Self::StopInstance => "stop instance",
            Self::CaptureImage => "capture image",
            Self::ReplicateAcrossRegions => "replicate across regions",
            Self::MaterializeTemplate => "materialize template definition",
            Self::PublishToRegistry => "publish to registry",
        }
    }
}

impl ImageBuilder {
    /// Save a running instance as a new template image.
    ///
    /// Mirrors [`ImageBuilder::build`]'s contract: the result always comes
    /// back, with the typed abort error alongside when a step failed.
    #[instrument(skip(self, request), fields(instance = %request.instance_id, template = %request.template_name))]
    pub async fn save_instance(
        &self,
        request: SaveInstanceRequest,
    ) -> (BuildResult, Option<BuildError>) {
        let mut pipeline = SavePipeline::new(self, request);
        let failure = pipeline.run().await;

        // Best-effort restart of the original instance, on every exit path.
        pipeline.restart_instance().await;

        let mut result = pipeline.result;
        result.duration = Some(pipeline.started.elapsed());
        result.finished_at = Some(Utc::now());
        match &failure {
            Some(err) => {
                result.status = BuildStatus::Failed;
                result.error_message = Some(err.to_string());
                error!(build_id = %result.build_id, error = %err, "instance save failed");
            }
            None => {
                result.status = BuildStatus::Completed;
                info!(
                    build_id = %result.build_id,
                    image = result.image_id.as_deref().unwrap_or_default(),
                    "instance saved in {:.1}s",
                    pipeline.started.elapsed().as_secs_f64()
                );
            }
        }

        (result, failure)
    }
}

struct SavePipeline<'a> {
    builder: &'a ImageBuilder,
    request: SaveInstanceRequest,
    result: BuildResult,
    image_name: Option<String>,
    artifact: Option<String>,
    started: Instant,
}

impl<'a> SavePipeline<'a> {
    fn new(builder: &'a ImageBuilder, request: SaveInstanceRequest) -> Self {
        let build_id = format!("save-{}-{}", request.instance_name, Utc::now().timestamp());

        let mut result = BuildResult {
            build_id,
            template_name: request.template_name.clone(),
            region: String::new(),
            architecture: Default::default(),
            status: BuildStatus::InProgress,
            source_image: None,
            image_id: None,
            copied_images: HashMap::new(),
            instance_id: Some(request.instance_id.clone()),
            version: None,
            error_message: None,
            log: String::new(),
            validation_log: None,
            finished_at: None,
            duration: None,
        };

        result.log.push_str(&format!("Instance save started at {}\n", Utc::now().to_rfc3339()));
        result.log.push_str(&format!("Instance: {}\n", request.instance_name));
        result.log.push_str(&format!("Target template: {}\n\n", request.template_name));

        Self { builder, request, result, image_name: None, artifact: None, started: Instant::now() }
    }

    async fn run(&mut self) -> Option<BuildError> {
        for step in SaveStep::SEQUENCE {
            info!(step = step.name(), "running save step");
            if let Err(err) = self.execute_step(step).await {
                self.log_line(&format!("{}: FAILED: {err}", step.name()));
                return Some(err);
            }
        }
        None
    }

    async fn execute_step(&mut self, step: SaveStep) -> Result<()> {
        match step {
            SaveStep::CaptureMetadata => self.capture_metadata().await,
            SaveStep::StopInstance => self.stop_instance().await,
            SaveStep::CaptureImage => self.capture_image().await,
            SaveStep::ReplicateAcrossRegions => self.replicate().await,
            SaveStep::MaterializeTemplate => self.materialize_template(),
            SaveStep::PublishToRegistry => self.publish_to_registry().await,
        }
    }

    fn log_line(&mut self, line: &str) {
        self.result.log.push_str(line);
        self.result.log.push('\n');
    }

    async fn capture_metadata(&mut self) -> Result<()> {
        let description = self.builder.compute().describe(&self.request.instance_id).await?;
        self.result.architecture = description.architecture;
        self.result.region = description.region;
        self.log_line(&format!(
            "instance {} | architecture {} | region {}",
            self.request.instance_id, self.result.architecture, self.result.region
        ));
        Ok(())
    }

    /// Stop the instance so the snapshot is crash-consistent.
    async fn stop_instance(&mut self) -> Result<()> {
        self.builder.compute().stop(&self.request.instance_id).await?;
        self.log_line("instance stopped");
        Ok(())
    }

    async fn capture_image(&mut self) -> Result<()> {
        let timestamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let name = format!(
            "{}-{}-{}-{}",
            self.request.template_name, self.result.architecture, self.result.region, timestamp
        );

        let mut tags = HashMap::new();
        tags.insert("Name".to_string(), name.clone());
        tags.insert("kiln:template".to_string(), self.request.template_name.clone());
        tags.insert("kiln:source".to_string(), "saved-instance".to_string());
        tags.insert("kiln:saved-from".to_string(), self.request.instance_name.clone());
        tags.insert("kiln:saved-date".to_string(), timestamp);
        tags.extend(self.request.tags.clone());

        let image_id = self
            .builder
            .compute()
            .capture_image(&self.request.instance_id, &name, &self.request.description, tags)
            .await?;
        info!(image_id = %image_id, "image capture started");
        self.log_line(&format!("image capture started: {image_id}"));
        self.result.image_id = Some(image_id.clone());
        self.image_name = Some(name);

        self.builder
            .compute()
            .wait_image_available(
                &image_id,
                &self.result.region,
                self.builder.config().waits.image_available(),
            )
            .await?;
        self.log_line("image available");
        Ok(())
    }

    /// Same fan-out as the build pipeline, but partial failures only warn;
    /// the save still counts with whatever copies succeeded.
    async fn replicate(&mut self) -> Result<()> {
        if self.request.copy_to_regions.is_empty() {
            return Ok(());
        }

        let Some(image_id) = self.result.image_id.clone() else {
            return Err(BuildError::internal("image was not captured"));
        };
        let name = self.image_name.clone().unwrap_or_else(|| image_id.clone());

        let (copied, failures) = replicate_image(
            Arc::clone(self.builder.compute()),
            &image_id,
            &format!("{name}-copy"),
            &self.request.description,
            &self.result.region,
            &self.request.copy_to_regions,
            self.builder.config().waits.image_available(),
        )
        .await;

        for (region, image) in &copied {
            self.log_line(&format!("copied to {region}: {image}"));
        }
        self.result.copied_images.extend(copied);

        for (region, err) in &failures {
            warn!(region = %region, error = %err, "image copy failed during save");
            self.log_line(&format!("copy to {region} failed: {err}"));
        }

        Ok(())
    }

    fn materialize_template(&mut self) -> Result<()> {
        let mut tags = HashMap::new();
        tags.insert("Name".to_string(), self.request.template_name.clone());
        tags.insert("kiln:source".to_string(), "saved-instance".to_string());

        let template = Template {
            name: self.request.template_name.clone(),
            base: "saved-instance".to_string(),
            description: self.request.description.clone(),
            tags,
            ..Template::default()
        };

        let architecture = self.result.architecture.to_string();
        let mut images: HashMap<String, HashMap<String, String>> = HashMap::new();
        if let Some(image_id) = &self.result.image_id {
            images
                .entry(self.result.region.clone())
                .or_default()
                .insert(architecture.clone(), image_id.clone());
        }
        for (region, image_id) in &self.result.copied_images {
            images
                .entry(region.clone())
                .or_default()
                .insert(architecture.clone(), image_id.clone());
        }

        let definition = TemplateDefinition { template: &template, images };
        match serde_json::to_string_pretty(&definition) {
            Ok(artifact) => {
                self.artifact = Some(artifact);
                self.log_line("template definition created");
            }
            Err(err) => {
                warn!(error = %err, "failed to serialize template definition");
                self.log_line(&format!("template definition failed: {err}"));
            }
        }

        Ok(())
    }

    /// Publishing is best-effort: a registry failure never fails the save.
    async fn publish_to_registry(&mut self) -> Result<()> {
        let Some(registry) = self.builder.registry() else {
            return Ok(());
        };

        if let Some(artifact) = self.artifact.clone() {
            let mut metadata = HashMap::new();
            metadata.insert("saved_from".to_string(), self.request.instance_name.clone());
            metadata.insert("saved_date".to_string(), Utc::now().to_rfc3339());

            if let Err(err) = registry
                .publish_template(&self.request.template_name, &artifact, "json", metadata)
                .await
            {
                warn!(error = %err, "failed to publish template definition");
                self.log_line(&format!("template publish failed: {err}"));
            } else {
                self.log_line("template definition published");
            }
        }

        if let Err(err) = registry.publish_image(&self.result).await {
            warn!(error = %err, "failed to register image in registry");
            self.log_line(&format!("image publish failed: {err}"));
        }

        for (region, image_id) in self.result.copied_images.clone() {
            let mut copied_result = self.result.clone();
            copied_result.image_id = Some(image_id);
            copied_result.region = region.clone();
            if let Err(err) = registry.publish_image(&copied_result).await {
                warn!(region = %region, error = %err, "failed to register copied image");
            }
        }

        Ok(())
    }

    /// Best-effort restart in the cleanup scope.
    async fn restart_instance(&mut self) {
        info!(instance_id = %self.request.instance_id, "restarting instance");

        if let Err(err) = self.builder.compute().start(&self.request.instance_id).await {
            warn!(instance_id = %self.request.instance_id, error = %err, "failed to restart instance");
            self.log_line(&format!("instance restart failed: {err}"));
            return;
        }

        let wait = self.builder.config().waits.restart_wait();
        if let Err(err) = self.builder.compute().wait_running(&self.request.instance_id, wait).await
        {
            warn!(instance_id = %self.request.instance_id, error = %err, "instance may not have restarted");
            self.log_line("instance restart not confirmed");
        } else {
            self.log_line("instance restarted");
        }
    }
}
