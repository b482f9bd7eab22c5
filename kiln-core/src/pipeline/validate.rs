//! Validation-check execution for freshly built images.

use crate::adapters::{CommandExecutor, CommandState, CommandStatus};
use crate::pipeline::run_remote_command;
use crate::types::template::ValidationCheck;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::info;

/// Aggregate outcome of running a template's validation checks.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub passed: usize,
    pub total: usize,
    pub failed_checks: Vec<String>,

    /// Per-check detail lines, in execution order.
    pub details: Vec<(String, String)>,
}

impl ValidationReport {
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        if self.all_passed() {
            format!("all {} validation checks passed", self.total)
        } else {
            format!(
                "{}/{} validation checks failed: {:?}",
                self.total - self.passed,
                self.total,
                self.failed_checks
            )
        }
    }

    /// Full multi-line report with per-check details.
    pub fn formatted(&self) -> String {
        let mut out = self.summary();
        for (name, detail) in &self.details {
            let _ = write!(out, "\n  {name}: {detail}");
        }
        out
    }
}

/// Run every declared check and count passes. Never fails fast; a check that
/// errors administratively is counted as failed with the error as detail.
pub(crate) async fn run_checks(
    executor: &dyn CommandExecutor,
    instance_id: &str,
    checks: &[ValidationCheck],
    check_timeout: Duration,
    poll_interval: Duration,
) -> ValidationReport {
    let mut report = ValidationReport {
        passed: 0,
        total: checks.len(),
        failed_checks: Vec::new(),
        details: Vec::new(),
    };

    for (index, check) in checks.iter().enumerate() {
        info!(check = %check.name, "running validation check {}/{}", index + 1, checks.len());

        let status = match run_remote_command(
            executor,
            instance_id,
            &check.command,
            check_timeout,
            poll_interval,
        )
        .await
        {
            Ok(status) => status,
            Err(err) => {
                report.failed_checks.push(check.name.clone());
                report.details.push((check.name.clone(), format!("ERROR: {err}")));
                continue;
            }
        };

        let (passed, detail) = evaluate(check, &status);
        if passed {
            report.passed += 1;
        } else {
            report.failed_checks.push(check.name.clone());
        }
        report.details.push((check.name.clone(), detail));
    }

    report
}

/// Evaluate one check against the command outcome. Every declared mode must
/// hold; a check declaring none falls back to requiring a successful exit.
fn evaluate(check: &ValidationCheck, status: &CommandStatus) -> (bool, String) {
    let exited_ok = status.state == CommandState::Success;
    let mut declared = false;
    let mut passed = true;
    let mut notes = Vec::new();

    if check.expect_success {
        declared = true;
        if exited_ok {
            notes.push("command succeeded".to_string());
        } else {
            passed = false;
            notes.push(format!("command finished with state {}", status.state));
        }
    }

    if let Some(needle) = &check.contains {
        declared = true;
        if status.stdout.contains(needle) {
            notes.push(format!("output contains '{needle}'"));
        } else {
            passed = false;
            notes.push(format!("output does not contain '{needle}'"));
        }
    }

    if let Some(expected) = &check.equals {
        declared = true;
        if status.stdout.trim() == expected.trim() {
            notes.push("output matches expected value".to_string());
        } else {
            passed = false;
            notes.push(format!(
                "output {:?} does not equal {:?}",
                status.stdout.trim(),
                expected.trim()
            ));
        }
    }

    if !declared {
        passed = exited_ok;
        notes.push(if exited_ok {
            "command succeeded".to_string()
        } else {
            format!("command finished with state {}", status.state)
        });
    }

    let prefix = if passed { "PASS" } else { "FAIL" };
    (passed, format!("{prefix}: {}", notes.join("; ")))
}
