//! Build pipelines.
//!
//! [`ImageBuilder`] owns the injected platform ports and drives two
//! structurally parallel pipelines: the template build pipeline and the
//! save-running-instance pipeline. Per-call state lives in the pipeline
//! structs, so one builder can serve concurrent invocations.

mod build;
mod replicate;
mod save;
mod validate;

pub use build::ImageBuilder;
pub use validate::ValidationReport;

use crate::adapters::{CommandExecutor, CommandStatus};
use crate::error::{BuildError, Result};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::debug;

/// Dispatch a script on an instance and poll until a terminal state.
///
/// Returns the terminal status, successful or not; interpreting it is the
/// caller's concern. The wait is bounded by the remote timeout plus a grace
/// period so the terminal state itself stays observable; expiry is a
/// retryable command error.
pub(crate) async fn run_remote_command(
    executor: &dyn CommandExecutor,
    instance_id: &str,
    script: &str,
    command_timeout: Duration,
    poll_interval: Duration,
) -> Result<CommandStatus> {
    let command_id = executor.send(instance_id, script, command_timeout).await?;

    let poll = async {
        loop {
            sleep(poll_interval).await;
            match executor.poll(&command_id, instance_id).await {
                Ok(status) if status.state.is_terminal() => return status,
                Ok(_) => {}
                Err(err) => {
                    // Transient lookup failures are expected right after dispatch.
                    debug!(command_id = %command_id, error = %err, "command poll failed, retrying");
                }
            }
        }
    };

    let deadline = command_timeout + Duration::from_secs(30);
    timeout(deadline, poll).await.map_err(|_| {
        BuildError::command("timeout waiting for remote command to complete")
            .retryable()
            .with_context("command_id", &command_id)
            .with_context("instance_id", instance_id)
    })
}
