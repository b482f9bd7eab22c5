//! Integration tests for the build and save-instance pipelines.
//!
//! Mock ports record every platform call, so the tests can assert the abort
//! invariant (release runs exactly once no matter which step failed), the
//! dry-run contract (no platform calls at all), and the best-effort
//! semantics of replication and cleanup.

use async_trait::async_trait;
use kiln_core::adapters::{
    CommandExecutor, CommandState, CommandStatus, ComputeProvider, ImageRegistry,
    InstanceDescription, InstanceSpec, SharedTemplateEntry,
};
use kiln_core::config::BuilderConfig;
use kiln_core::error::{BuildError, ErrorKind, Result};
use kiln_core::types::build::{
    Architecture, BuildRequest, BuildResult, BuildStatus, SaveInstanceRequest, DRY_RUN_IMAGE,
    DRY_RUN_INSTANCE,
};
use kiln_core::types::template::{BuildAction, Template, ValidationCheck};
use kiln_core::ImageBuilder;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Compute fake that records every call.
#[derive(Default)]
struct MockCompute {
    provision_calls: AtomicUsize,
    terminate_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    start_calls: AtomicUsize,
    capture_calls: AtomicUsize,
    copy_calls: AtomicUsize,
    default_sg_calls: AtomicUsize,
    specs: Mutex<Vec<InstanceSpec>>,
    fail_copy_regions: Mutex<HashSet<String>>,
    fail_capture: Mutex<bool>,
    described_region: Mutex<String>,
}

impl MockCompute {
    fn new() -> Arc<Self> {
        let mock = Self::default();
        *mock.described_region.lock().unwrap() = "us-east-1".to_string();
        Arc::new(mock)
    }

    fn fail_copies_to(&self, region: &str) {
        self.fail_copy_regions.lock().unwrap().insert(region.to_string());
    }

    fn fail_capture(&self) {
        *self.fail_capture.lock().unwrap() = true;
    }

    fn total_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
            + self.terminate_calls.load(Ordering::SeqCst)
            + self.stop_calls.load(Ordering::SeqCst)
            + self.start_calls.load(Ordering::SeqCst)
            + self.capture_calls.load(Ordering::SeqCst)
            + self.copy_calls.load(Ordering::SeqCst)
            + self.default_sg_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeProvider for MockCompute {
    async fn provision(&self, spec: &InstanceSpec) -> Result<String> {
        let count = self.provision_calls.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec.clone());
        Ok(format!("i-mock-{count}"))
    }

    async fn wait_running(&self, _instance_id: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn describe(&self, _instance_id: &str) -> Result<InstanceDescription> {
        Ok(InstanceDescription {
            architecture: Architecture::Arm64,
            region: self.described_region.lock().unwrap().clone(),
        })
    }

    async fn capture_image(
        &self,
        _instance_id: &str,
        _name: &str,
        _description: &str,
        _tags: HashMap<String, String>,
    ) -> Result<String> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_capture.lock().unwrap() {
            return Err(BuildError::image_creation("capture refused"));
        }
        Ok("ami-built".to_string())
    }

    async fn wait_image_available(
        &self,
        _image_id: &str,
        _region: &str,
        _timeout: Duration,
    ) -> Result<()> {
        Ok(())
    }

    async fn copy_image(
        &self,
        _image_id: &str,
        _name: &str,
        _description: &str,
        _source_region: &str,
        target_region: &str,
    ) -> Result<String> {
        self.copy_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_copy_regions.lock().unwrap().contains(target_region) {
            return Err(BuildError::image_creation(format!(
                "copy to {target_region} refused"
            ))
            .retryable());
        }
        Ok(format!("ami-copy-{target_region}"))
    }

    async fn stop(&self, _instance_id: &str) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, _instance_id: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self, _instance_id: &str) -> Result<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn default_security_group(&self, _vpc_id: &str) -> Result<String> {
        self.default_sg_calls.fetch_add(1, Ordering::SeqCst);
        Ok("sg-default".to_string())
    }
}

/// Command-channel fake. Commands finish immediately; scripts listed in
/// `failing` finish in a failed state, and per-script stdout can be staged.
#[derive(Default)]
struct MockExecutor {
    agent_online: Mutex<bool>,
    failing: Mutex<HashSet<String>>,
    stdout: Mutex<HashMap<String, String>>,
    sent: Mutex<HashMap<String, String>>,
    send_calls: AtomicUsize,
}

impl MockExecutor {
    fn new() -> Arc<Self> {
        let mock = Self::default();
        *mock.agent_online.lock().unwrap() = true;
        Arc::new(mock)
    }

    fn fail_script(&self, script: &str) {
        self.failing.lock().unwrap().insert(script.to_string());
    }

    fn stage_stdout(&self, script: &str, stdout: &str) {
        self.stdout.lock().unwrap().insert(script.to_string(), stdout.to_string());
    }

    fn set_agent_online(&self, online: bool) {
        *self.agent_online.lock().unwrap() = online;
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn send(&self, _instance_id: &str, script: &str, _timeout: Duration) -> Result<String> {
        let id = format!("cmd-{}", self.send_calls.fetch_add(1, Ordering::SeqCst));
        self.sent.lock().unwrap().insert(id.clone(), script.to_string());
        Ok(id)
    }

    async fn poll(&self, command_id: &str, _instance_id: &str) -> Result<CommandStatus> {
        let script = self
            .sent
            .lock()
            .unwrap()
            .get(command_id)
            .cloned()
            .ok_or_else(|| BuildError::command("unknown command"))?;

        if self.failing.lock().unwrap().contains(&script) {
            return Ok(CommandStatus {
                state: CommandState::Failed,
                stdout: String::new(),
                stderr: "exit status 1".to_string(),
            });
        }

        let stdout = self.stdout.lock().unwrap().get(&script).cloned().unwrap_or_default();
        Ok(CommandStatus { state: CommandState::Success, stdout, stderr: String::new() })
    }

    async fn agent_online(&self, _instance_id: &str) -> Result<bool> {
        Ok(*self.agent_online.lock().unwrap())
    }
}

/// Registry fake recording publishes.
#[derive(Default)]
struct MockRegistry {
    published_images: Mutex<Vec<BuildResult>>,
    published_templates: Mutex<Vec<String>>,
}

#[async_trait]
impl ImageRegistry for MockRegistry {
    async fn list_versions(&self, _template_name: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_shared_templates(&self) -> Result<HashMap<String, SharedTemplateEntry>> {
        Ok(HashMap::new())
    }

    async fn get_shared_template(
        &self,
        name: &str,
        _version: Option<&str>,
    ) -> Result<SharedTemplateEntry> {
        Err(BuildError::registry(format!("shared template '{name}' not found")))
    }

    async fn publish_image(&self, result: &BuildResult) -> Result<()> {
        self.published_images.lock().unwrap().push(result.clone());
        Ok(())
    }

    async fn publish_template(
        &self,
        name: &str,
        _data: &str,
        _format: &str,
        _metadata: HashMap<String, String>,
    ) -> Result<()> {
        self.published_templates.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// Config with zeroed poll intervals so waits resolve immediately.
fn test_config() -> BuilderConfig {
    let mut config = BuilderConfig::default();
    config.waits.agent_poll_interval_secs = 0;
    config.waits.command_poll_interval_secs = 0;
    config
}

fn template() -> Template {
    Template {
        name: "python".to_string(),
        base: "ubuntu-22.04-server-lts".to_string(),
        build_steps: vec![
            BuildAction {
                name: "install python".to_string(),
                script: "apt-get install -y python3".to_string(),
                timeout_secs: None,
            },
            BuildAction {
                name: "install pip".to_string(),
                script: "apt-get install -y python3-pip".to_string(),
                timeout_secs: Some(120),
            },
        ],
        validation: vec![ValidationCheck {
            name: "python present".to_string(),
            command: "python3 --version".to_string(),
            expect_success: true,
            contains: Some("Python 3".to_string()),
            equals: None,
        }],
        ..Template::default()
    }
}

fn request(template: Template) -> BuildRequest {
    BuildRequest {
        template_name: template.name.clone(),
        template,
        region: "us-east-1".to_string(),
        architecture: Architecture::X86_64,
        version: Some("1.0.0".to_string()),
        dry_run: false,
        build_id: Some("test0001".to_string()),
        vpc_id: None,
        subnet_id: Some("subnet-test".to_string()),
        security_group: Some("sg-test".to_string()),
        copy_to_regions: Vec::new(),
    }
}

fn builder(
    compute: &Arc<MockCompute>,
    executor: &Arc<MockExecutor>,
    registry: Option<Arc<MockRegistry>>,
) -> ImageBuilder {
    ImageBuilder::new(
        Arc::clone(compute) as Arc<dyn ComputeProvider>,
        Arc::clone(executor) as Arc<dyn CommandExecutor>,
        registry.map(|r| r as Arc<dyn ImageRegistry>),
        test_config(),
    )
}

fn save_request() -> SaveInstanceRequest {
    SaveInstanceRequest {
        instance_id: "i-live".to_string(),
        instance_name: "workbench".to_string(),
        template_name: "workbench-snapshot".to_string(),
        description: "saved workbench".to_string(),
        copy_to_regions: Vec::new(),
        tags: HashMap::new(),
    }
}

#[tokio::test]
async fn successful_build_completes_and_releases_instance() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    executor.stage_stdout("python3 --version", "Python 3.11.4");

    let (result, error) = builder(&compute, &executor, None).build(request(template())).await;

    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(result.status, BuildStatus::Completed);
    assert!(result.is_successful());
    assert_eq!(result.image_id.as_deref(), Some("ami-built"));
    assert_eq!(result.source_image.as_deref(), Some("ami-02029c87fa31fb148"));
    assert_eq!(compute.terminate_calls.load(Ordering::SeqCst), 1);
    assert!(result.log.contains("image available"));
    assert!(result.validation_log.is_some());
}

#[tokio::test]
async fn dry_run_makes_no_platform_calls() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    let mut req = request(template());
    req.dry_run = true;
    req.subnet_id = None;
    req.copy_to_regions = vec!["us-west-2".to_string()];

    let (result, error) = builder(&compute, &executor, None).build(req).await;

    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(result.status, BuildStatus::DryRunComplete);
    assert!(result.is_successful());
    assert_eq!(result.instance_id.as_deref(), Some(DRY_RUN_INSTANCE));
    assert_eq!(result.image_id.as_deref(), Some(DRY_RUN_IMAGE));
    assert_eq!(compute.total_calls(), 0);
    assert_eq!(executor.send_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_action_aborts_and_still_releases_once() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    executor.fail_script("apt-get install -y python3");

    let (result, error) = builder(&compute, &executor, None).build(request(template())).await;

    let err = error.expect("build should fail");
    assert_eq!(err.kind(), ErrorKind::Command);
    assert!(err.to_string().contains("install python"));
    assert_eq!(result.status, BuildStatus::Failed);
    assert!(result.error_message.is_some());
    // The second action never ran.
    assert!(!result.log.contains("'install pip'"));
    // Capture never happened, release did, exactly once.
    assert_eq!(compute.capture_calls.load(Ordering::SeqCst), 0);
    assert_eq!(compute.terminate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn validation_shortfall_is_fatal_even_without_command_errors() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    // Both checks execute cleanly, one fails its content assertion.
    executor.stage_stdout("python3 --version", "Python 3.11.4");
    executor.stage_stdout("pip3 --version", "pip 19.0");

    let mut template = template();
    template.validation.push(ValidationCheck {
        name: "pip is modern".to_string(),
        command: "pip3 --version".to_string(),
        expect_success: true,
        contains: Some("pip 23".to_string()),
        equals: None,
    });

    let (result, error) = builder(&compute, &executor, None).build(request(template)).await;

    let err = error.expect("validation should fail the build");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.context().get("passed").map(String::as_str), Some("1"));
    assert_eq!(err.context().get("total").map(String::as_str), Some("2"));
    assert_eq!(result.status, BuildStatus::Failed);
    assert_eq!(compute.terminate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_validation_checks_is_a_warning_not_a_failure() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    let mut template = template();
    template.validation.clear();

    let (result, error) = builder(&compute, &executor, None).build(request(template)).await;

    assert!(error.is_none());
    assert_eq!(result.status, BuildStatus::Completed);
    assert!(result.log.contains("no validation checks declared"));
}

#[tokio::test]
async fn partial_copy_failure_keeps_successes_and_names_failed_region() {
    let compute = MockCompute::new();
    compute.fail_copies_to("eu-west-1");
    let executor = MockExecutor::new();
    executor.stage_stdout("python3 --version", "Python 3.11.4");

    let mut req = request(template());
    req.copy_to_regions =
        vec!["us-east-2".to_string(), "us-west-2".to_string(), "eu-west-1".to_string()];

    let (result, error) = builder(&compute, &executor, None).build(req).await;

    let err = error.expect("replication should fail the build");
    assert_eq!(err.kind(), ErrorKind::ImageCreation);
    assert!(err.to_string().contains("eu-west-1"));

    assert_eq!(result.status, BuildStatus::Failed);
    assert_eq!(result.copied_images.len(), 2);
    assert_eq!(result.copied_images.get("us-east-2").map(String::as_str), Some("ami-copy-us-east-2"));
    assert_eq!(result.copied_images.get("us-west-2").map(String::as_str), Some("ami-copy-us-west-2"));
    assert_eq!(compute.terminate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn copy_targets_are_deduplicated_and_source_region_skipped() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    executor.stage_stdout("python3 --version", "Python 3.11.4");

    let mut req = request(template());
    req.copy_to_regions = vec![
        "us-east-1".to_string(),
        "us-east-2".to_string(),
        "us-east-2".to_string(),
    ];

    let (result, error) = builder(&compute, &executor, None).build(req).await;

    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(compute.copy_calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.copied_images.len(), 1);
    assert!(result.copied_images.contains_key("us-east-2"));
}

#[tokio::test]
async fn missing_subnet_fails_validation_before_provisioning() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    let mut req = request(template());
    req.subnet_id = None;

    let (result, error) = builder(&compute, &executor, None).build(req).await;

    let err = error.expect("missing subnet should fail");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(result.status, BuildStatus::Failed);
    assert_eq!(compute.provision_calls.load(Ordering::SeqCst), 0);
    assert_eq!(compute.terminate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unsupported_region_fails_validation() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    let mut req = request(template());
    req.region = "mars-north-1".to_string();

    let (_, error) = builder(&compute, &executor, None).build(req).await;
    let err = error.expect("unsupported region should fail");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(compute.total_calls(), 0);
}

#[tokio::test]
async fn security_group_falls_back_to_platform_default() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    executor.stage_stdout("python3 --version", "Python 3.11.4");

    let mut req = request(template());
    req.security_group = None;

    let (_, error) = builder(&compute, &executor, None).build(req).await;

    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(compute.default_sg_calls.load(Ordering::SeqCst), 1);
    let specs = compute.specs.lock().unwrap();
    assert_eq!(specs[0].security_group, "sg-default");
}

#[tokio::test]
async fn agent_never_online_times_out_retryably() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    executor.set_agent_online(false);

    let builder = {
        let mut config = test_config();
        config.waits.agent_poll_attempts = 1;
        ImageBuilder::new(
            Arc::clone(&compute) as Arc<dyn ComputeProvider>,
            Arc::clone(&executor) as Arc<dyn CommandExecutor>,
            None,
            config,
        )
    };

    let (result, error) = builder.build(request(template())).await;

    let err = error.expect("agent wait should time out");
    assert_eq!(err.kind(), ErrorKind::Instance);
    assert!(err.is_retryable());
    assert_eq!(result.status, BuildStatus::Failed);
    // The instance was provisioned, so it must still be released.
    assert_eq!(compute.terminate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn save_instance_captures_publishes_and_restarts() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    let registry = Arc::new(MockRegistry::default());

    let (result, error) = builder(&compute, &executor, Some(Arc::clone(&registry)))
        .save_instance(save_request())
        .await;

    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(result.status, BuildStatus::Completed);
    assert_eq!(result.architecture, Architecture::Arm64);
    assert_eq!(result.region, "us-east-1");
    assert_eq!(result.image_id.as_deref(), Some("ami-built"));

    assert_eq!(compute.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(compute.capture_calls.load(Ordering::SeqCst), 1);
    assert_eq!(compute.start_calls.load(Ordering::SeqCst), 1);
    // The save pipeline never terminates the instance it captured.
    assert_eq!(compute.terminate_calls.load(Ordering::SeqCst), 0);

    assert_eq!(
        *registry.published_templates.lock().unwrap(),
        vec!["workbench-snapshot".to_string()]
    );
    assert_eq!(registry.published_images.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn save_replication_failure_is_logged_not_fatal() {
    let compute = MockCompute::new();
    compute.fail_copies_to("eu-west-1");
    let executor = MockExecutor::new();
    let registry = Arc::new(MockRegistry::default());

    let mut req = save_request();
    req.copy_to_regions = vec!["us-east-2".to_string(), "eu-west-1".to_string()];

    let (result, error) = builder(&compute, &executor, Some(Arc::clone(&registry)))
        .save_instance(req)
        .await;

    assert!(error.is_none(), "partial copy failure must not fail a save: {error:?}");
    assert_eq!(result.status, BuildStatus::Completed);
    assert_eq!(result.copied_images.len(), 1);
    assert!(result.log.contains("copy to eu-west-1 failed"));
    assert_eq!(compute.start_calls.load(Ordering::SeqCst), 1);
    // Primary image plus the one successful copy were published.
    assert_eq!(registry.published_images.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn save_capture_failure_still_restarts_instance() {
    let compute = MockCompute::new();
    compute.fail_capture();
    let executor = MockExecutor::new();

    let (result, error) = builder(&compute, &executor, None).save_instance(save_request()).await;

    let err = error.expect("capture failure should fail the save");
    assert_eq!(err.kind(), ErrorKind::ImageCreation);
    assert_eq!(result.status, BuildStatus::Failed);
    assert_eq!(compute.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(compute.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_builds_share_one_builder() {
    let compute = MockCompute::new();
    let executor = MockExecutor::new();
    executor.stage_stdout("python3 --version", "Python 3.11.4");
    let builder = Arc::new(builder(&compute, &executor, None));

    let mut handles = Vec::new();
    for index in 0..4 {
        let builder = Arc::clone(&builder);
        let mut req = request(template());
        req.build_id = Some(format!("build-{index}"));
        handles.push(tokio::spawn(async move { builder.build(req).await }));
    }

    for handle in handles {
        let (result, error) = handle.await.unwrap();
        assert!(error.is_none());
        assert_eq!(result.status, BuildStatus::Completed);
    }
    assert_eq!(compute.provision_calls.load(Ordering::SeqCst), 4);
    assert_eq!(compute.terminate_calls.load(Ordering::SeqCst), 4);
}
