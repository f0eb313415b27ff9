//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats. JSON output is one compact
//! object per call so that it can be piped line by line.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::aws::Bindings;
use crate::config::{SpecHasher, ValidationResult};
use crate::error::DeployError;
use crate::planner::{OperationKind, OperationOutcome, Plan};
use crate::reconciler::{RunOutcome, RunPhase};
use crate::state::{DeploymentRecord, LockInfo, RunRecord};
use crate::status::{ConvergenceOutcome, ServiceSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Run history row for table display.
#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Applied")]
    applied: String,
    #[tabled(rename = "Took")]
    took: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, target: &str, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson { target, plan, summary: plan.summary().to_string() }),
            OutputFormat::Text => Self::format_plan_text(target, plan),
        }
    }

    fn format_plan_text(target: &str, plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required, {target} is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan for {}", target.bold());
        if !plan.spec_hash.is_empty() {
            let _ = writeln!(output, "   Spec hash: {}", SpecHasher::short_hash(&plan.spec_hash));
        }
        output.push('\n');

        let rows: Vec<PlanRow> = plan
            .operations
            .iter()
            .map(|op| PlanRow {
                index: op.index,
                action: Self::format_kind(op.kind),
                resource: op.resource.to_string(),
                name: op.name.clone(),
                after: op
                    .depends_on
                    .iter()
                    .map(|d| format!("#{d}"))
                    .collect::<Vec<_>>()
                    .join(", "),
                reason: truncate(&op.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let changes: Vec<_> = plan
            .operations
            .iter()
            .filter(|op| !op.changes.is_empty())
            .collect();
        if !changes.is_empty() {
            output.push_str("\nChanges:\n");
            for op in changes {
                let _ = writeln!(output, "   #{} {}", op.index, op.description());
                for change in &op.changes {
                    let _ = writeln!(
                        output,
                        "      {}: {} -> {}",
                        change.field,
                        change.observed.red(),
                        change.desired.green()
                    );
                }
            }
        }

        let summary = plan.summary();
        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete",
            summary.creates.to_string().green(),
            summary.updates.to_string().yellow(),
            summary.deletes.to_string().red()
        );
        output
    }

    /// Formats the result of a deploy, update or teardown run.
    #[must_use]
    pub fn format_outcome(&self, target: &str, outcome: &RunOutcome) -> String {
        match self.format {
            OutputFormat::Json => to_json(&OutcomeJson::new(target, outcome)),
            OutputFormat::Text => Self::format_outcome_text(target, outcome),
        }
    }

    fn format_outcome_text(target: &str, outcome: &RunOutcome) -> String {
        let headline = match outcome.phase {
            RunPhase::Succeeded => format!("{} {} of {target} succeeded", "✓".green(), outcome.run.kind),
            RunPhase::TimedOut => format!("{} {} of {target} timed out", "⚠".yellow(), outcome.run.kind),
            _ => format!("{} {} of {target} failed", "✗".red(), outcome.run.kind),
        };

        let mut output = format!("\n{headline}\n\n");
        let _ = writeln!(output, "   Run: {}", outcome.run.run_id);
        if !outcome.run.spec_hash.is_empty() {
            let _ = writeln!(output, "   Spec hash: {}", SpecHasher::short_hash(&outcome.run.spec_hash));
        }
        match &outcome.apply {
            Some(report) => {
                let _ = writeln!(
                    output,
                    "   Applied: {} ({} failed, {} skipped)",
                    report.completed(),
                    report.failed(),
                    report.skipped()
                );
                for op in &report.operations {
                    match &op.outcome {
                        OperationOutcome::Succeeded => {}
                        OperationOutcome::Failed(reason) => {
                            let _ = writeln!(output, "     {} {}: {reason}", "✗".red(), op.description);
                        }
                        OperationOutcome::Skipped(reason) => {
                            let _ = writeln!(output, "     {} {}: {reason}", "-".dimmed(), op.description);
                        }
                    }
                }
            }
            None if outcome.plan.is_some() => {
                output.push_str("   Applied: nothing to change\n");
            }
            None => {}
        }
        if let Some(convergence) = &outcome.convergence {
            let snapshot = convergence.snapshot();
            let _ = writeln!(
                output,
                "   Tasks: {}/{} running, {} healthy targets",
                snapshot.running, snapshot.desired, snapshot.healthy_targets
            );
        }
        if let Some(dns) = &outcome.bindings.load_balancer_dns {
            let _ = writeln!(output, "   Endpoint: http://{dns}");
        }
        let _ = writeln!(output, "   Took: {}", format_duration(outcome.run.duration()));

        if let Some(error) = &outcome.error {
            let _ = write!(output, "\n{} {error}\n", "Error:".red().bold());
        }
        output
    }

    /// Formats a live service snapshot.
    #[must_use]
    pub fn format_snapshot(&self, snapshot: &ServiceSnapshot) -> String {
        match self.format {
            OutputFormat::Json => to_json(snapshot),
            OutputFormat::Text => Self::format_snapshot_text(snapshot),
        }
    }

    fn format_snapshot_text(snapshot: &ServiceSnapshot) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "\nService: {}/{}\n", snapshot.cluster, snapshot.service);

        let verdict = if snapshot.is_converged() {
            "converged".green().to_string()
        } else {
            "converging".yellow().to_string()
        };
        let _ = writeln!(output, "   Status: {} ({verdict})", snapshot.status);
        let _ = writeln!(
            output,
            "   Tasks: {} running, {} pending, {} desired",
            snapshot.running, snapshot.pending, snapshot.desired
        );
        let _ = writeln!(output, "   Healthy targets: {}", snapshot.healthy_targets);
        if snapshot.unhealthy_tasks > 0 {
            let _ = writeln!(
                output,
                "   Unhealthy tasks: {}",
                snapshot.unhealthy_tasks.to_string().red()
            );
        }
        if let Some(rollout) = snapshot.rollout {
            let _ = writeln!(output, "   Rollout: {rollout} ({} deployments)", snapshot.deployments);
        }
        let _ = writeln!(output, "   Task definition: {}", snapshot.task_definition_arn);
        if let Some(probe) = &snapshot.probe {
            let result = match (probe.healthy, probe.status_code, &probe.error) {
                (true, Some(code), _) => format!("{} {code}", "✓".green()),
                (false, Some(code), _) => format!("{} {code}", "✗".red()),
                (_, None, Some(error)) => format!("{} {error}", "✗".red()),
                _ => String::from("no response"),
            };
            let _ = writeln!(output, "   Probe: {} {result}", probe.url);
        }
        let _ = writeln!(
            output,
            "   Observed: {}",
            snapshot.observed_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        output
    }

    /// Formats how a `status --wait` ended.
    #[must_use]
    pub fn format_convergence(&self, outcome: &ConvergenceOutcome) -> String {
        let (verdict, detail) = match outcome {
            ConvergenceOutcome::Succeeded(_) => ("succeeded", None),
            ConvergenceOutcome::TimedOut { timeout, .. } => {
                ("timed_out", Some(format!("not converged after {}s", timeout.as_secs())))
            }
            ConvergenceOutcome::Degraded { reason, .. } => ("failed", Some(reason.clone())),
        };

        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "result": verdict,
                "detail": detail,
                "snapshot": outcome.snapshot(),
            })),
            OutputFormat::Text => {
                let mut output = Self::format_snapshot_text(outcome.snapshot());
                let line = match (outcome, detail) {
                    (ConvergenceOutcome::Succeeded(_), _) => format!("{} Service converged", "✓".green()),
                    (ConvergenceOutcome::TimedOut { .. }, Some(detail)) => {
                        format!("{} {detail}", "⚠".yellow())
                    }
                    (_, detail) => format!("{} {}", "✗".red(), detail.unwrap_or_default()),
                };
                let _ = write!(output, "\n{line}\n");
                output
            }
        }
    }

    /// Formats a stored record with its current lock.
    #[must_use]
    pub fn format_record(&self, record: &DeploymentRecord, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "record": record,
                "lock": lock,
            })),
            OutputFormat::Text => Self::format_record_text(record, lock),
        }
    }

    fn format_record_text(record: &DeploymentRecord, lock: Option<&LockInfo>) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "\nState: {}/{}\n", record.cluster, record.service);

        let _ = writeln!(output, "   Version: {}", record.version);
        let hash = record
            .spec_hash
            .as_deref()
            .map_or_else(|| String::from("(not deployed)"), SpecHasher::short_hash);
        let _ = writeln!(output, "   Spec hash: {hash}");
        if let Some(phase) = record.last_phase {
            let _ = writeln!(output, "   Last phase: {}", Self::format_phase(phase));
        }
        let _ = writeln!(output, "   Updated: {}", record.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

        let bound = Self::binding_lines(&record.bindings);
        if !bound.is_empty() {
            output.push_str("\n   Resources:\n");
            for (name, value) in bound {
                let _ = writeln!(output, "     {name}: {value}");
            }
        }

        match lock {
            Some(lock) if !lock.is_expired() => {
                let _ = writeln!(
                    output,
                    "\n   {} Locked by {} since {} ({}s left)",
                    "⚠".yellow(),
                    lock.holder,
                    lock.acquired_at.format("%H:%M:%S"),
                    lock.remaining_secs()
                );
            }
            Some(lock) => {
                let _ = writeln!(output, "\n   Expired lock left by {}", lock.holder);
            }
            None => {}
        }

        if !record.history.is_empty() {
            let _ = writeln!(output, "\n   Recent runs ({} recorded):", record.history.len());
            let rows: Vec<HistoryRow> = record.history.iter().rev().take(10).map(Self::history_row).collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }
        output
    }

    fn history_row(run: &RunRecord) -> HistoryRow {
        HistoryRow {
            started: run.started_at.format("%Y-%m-%d %H:%M").to_string(),
            kind: run.kind.to_string(),
            phase: Self::format_phase(run.phase),
            hash: if run.spec_hash.is_empty() {
                String::from("-")
            } else {
                SpecHasher::short_hash(&run.spec_hash)
            },
            applied: format!("{}/{}", run.applied, run.applied + run.not_applied),
            took: format_duration(run.duration()),
        }
    }

    /// Formats validation findings.
    #[must_use]
    pub fn format_validation(&self, source: &str, result: &ValidationResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "source": source,
                "valid": result.is_valid(),
                "errors": result.errors,
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} {source} is valid\n", "✓".green())
                } else {
                    let mut output = format!("{} {source} is invalid:\n", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field.bold(), error.message);
                    }
                    output
                };
                for warning in &result.warnings {
                    let _ = writeln!(output, "   {} {warning}", "⚠".yellow());
                }
                output
            }
        }
    }

    /// Formats a plain message.
    #[must_use]
    pub fn format_message(&self, status: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => match status {
                "success" => format!("{} {message}\n", "✓".green()),
                "warning" => format!("{} {message}\n", "⚠".yellow()),
                _ => format!("{message}\n"),
            },
        }
    }

    /// Formats a command error.
    #[must_use]
    pub fn format_error(&self, error: &DeployError) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "status": "error",
                "message": error.to_string(),
                "retryable": error.is_retryable(),
            })),
            OutputFormat::Text => format!("{} {error}\n", "Error:".red().bold()),
        }
    }

    fn format_kind(kind: OperationKind) -> String {
        match kind {
            OperationKind::Create => "+create".green().to_string(),
            OperationKind::Update => "~update".yellow().to_string(),
            OperationKind::Delete => "-delete".red().to_string(),
        }
    }

    fn format_phase(phase: RunPhase) -> String {
        match phase {
            RunPhase::Succeeded => phase.to_string().green().to_string(),
            RunPhase::TimedOut => phase.to_string().yellow().to_string(),
            RunPhase::Failed => phase.to_string().red().to_string(),
            _ => phase.to_string(),
        }
    }

    fn binding_lines(bindings: &Bindings) -> Vec<(&'static str, &str)> {
        [
            ("cluster", &bindings.cluster_arn),
            ("target group", &bindings.target_group_arn),
            ("load balancer", &bindings.load_balancer_arn),
            ("dns", &bindings.load_balancer_dns),
            ("listener", &bindings.listener_arn),
            ("task definition", &bindings.task_definition_arn),
            ("service", &bindings.service_arn),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|v| (name, v)))
        .collect()
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    let mut line = serde_json::to_string(value).unwrap_or_default();
    line.push('\n');
    line
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[derive(Serialize)]
struct PlanJson<'a> {
    target: &'a str,
    summary: String,
    #[serde(flatten)]
    plan: &'a Plan,
}

#[derive(Serialize)]
struct OperationJson<'a> {
    index: usize,
    description: &'a str,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

#[derive(Serialize)]
struct OutcomeJson<'a> {
    target: &'a str,
    phase: RunPhase,
    exit_code: i32,
    run: &'a RunRecord,
    operations: Vec<OperationJson<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<&'a ServiceSnapshot>,
    bindings: &'a Bindings,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<'a> OutcomeJson<'a> {
    fn new(target: &'a str, outcome: &'a RunOutcome) -> Self {
        let operations = outcome
            .apply
            .iter()
            .flat_map(|report| report.operations.iter())
            .map(|op| {
                let (status, detail) = match &op.outcome {
                    OperationOutcome::Succeeded => ("succeeded", None),
                    OperationOutcome::Failed(reason) => ("failed", Some(reason.as_str())),
                    OperationOutcome::Skipped(reason) => ("skipped", Some(reason.as_str())),
                };
                OperationJson {
                    index: op.index,
                    description: &op.description,
                    outcome: status,
                    detail,
                }
            })
            .collect();

        Self {
            target,
            phase: outcome.phase,
            exit_code: outcome.exit_code(),
            run: &outcome.run,
            operations,
            snapshot: outcome.convergence.as_ref().map(ConvergenceOutcome::snapshot),
            bindings: &outcome.bindings,
            error: outcome.error.as_ref().map(ToString::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::fake::{FakeCloud, test_spec};
    use crate::aws::{CloudApi, StateObserver};
    use crate::config::SpecValidator;
    use crate::planner::{DiffEngine, PlanMode};
    use crate::reconciler::RunKind;
    use std::sync::Arc;

    async fn fresh_plan() -> Plan {
        let api: Arc<dyn CloudApi> = Arc::new(FakeCloud::new());
        let spec = test_spec();
        let observed = StateObserver::new(api).observe(&spec).await.unwrap();
        DiffEngine::new().plan(&spec, &observed, PlanMode::Deploy).unwrap()
    }

    #[tokio::test]
    async fn test_plan_text_lists_operations() {
        colored::control::set_override(false);
        let plan = fresh_plan().await;
        let text = OutputFormatter::new(OutputFormat::Text).format_plan("lamp-cluster/lamp", &plan);

        assert!(text.contains("Plan for lamp-cluster/lamp"));
        assert!(text.contains("+create"));
        assert!(text.contains("Plan: 6 to create, 0 to update, 0 to delete"));
    }

    #[tokio::test]
    async fn test_plan_json_is_one_line() {
        let plan = fresh_plan().await;
        let json = OutputFormatter::new(OutputFormat::Json).format_plan("lamp-cluster/lamp", &plan);

        assert_eq!(json.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["target"], "lamp-cluster/lamp");
        assert_eq!(value["operations"].as_array().unwrap().len(), 6);
        assert_eq!(value["summary"], "6 to create, 0 to update, 0 to delete");
    }

    #[test]
    fn test_empty_plan() {
        colored::control::set_override(false);
        let plan = Plan::new("abc", Vec::new()).unwrap();
        let text = OutputFormatter::new(OutputFormat::Text).format_plan("c/s", &plan);
        assert!(text.contains("No changes required"));
    }

    #[test]
    fn test_validation_output() {
        colored::control::set_override(false);
        let mut spec = test_spec();
        spec.task.container.port = Some(70000);
        let result = SpecValidator::new().check(&spec);

        let text = OutputFormatter::new(OutputFormat::Text).format_validation("ecs-deploy.yaml", &result);
        assert!(text.contains("is invalid"));
        assert!(text.contains("task.container.port"));

        let json = OutputFormatter::new(OutputFormat::Json).format_validation("ecs-deploy.yaml", &result);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["valid"], false);
        assert_eq!(value["errors"][0]["field"], "task.container.port");
    }

    #[test]
    fn test_record_text() {
        colored::control::set_override(false);
        let mut record = DeploymentRecord::new("lamp-cluster", "lamp");
        let mut run = RunRecord::start(RunKind::Deploy, "0123456789abcdef");
        run.applied = 6;
        run.finish(RunPhase::Succeeded, None);
        record.record_run(run);
        record.bindings.load_balancer_dns = Some(String::from("lamp-alb.elb.amazonaws.com"));

        let lock = LockInfo::new("lamp-cluster", "ci-runner");
        let text = OutputFormatter::new(OutputFormat::Text).format_record(&record, Some(&lock));

        assert!(text.contains("State: lamp-cluster/lamp"));
        assert!(text.contains("dns: lamp-alb.elb.amazonaws.com"));
        assert!(text.contains("Locked by ci-runner"));
        assert!(text.contains("6/6"));
    }

    #[test]
    fn test_error_json() {
        let err = DeployError::internal("boom");
        let json = OutputFormatter::new(OutputFormat::Json).format_error(&err);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["retryable"], false);
    }

    #[test]
    fn test_truncate_and_duration() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a long reason text", 10), "a long ...");
        assert_eq!(format_duration(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_duration(chrono::Duration::seconds(125)), "2m05s");
    }
}
