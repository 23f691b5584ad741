//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ConfigHasher;
use crate::planner::{ExecutionPlan, StepAction, StepStatus};
use crate::reconciler::RunResult;
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Step result row for table display.
#[derive(Tabled)]
struct StepResultRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
}

/// State record row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Policy")]
    policy: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the configured format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ExecutionPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ExecutionPlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nExecution Plan");
        if !plan.desired_hash.is_empty() {
            let _ = writeln!(
                output,
                "   Desired hash: {}",
                ConfigHasher::short_hash(&plan.desired_hash)
            );
        }
        output.push('\n');

        let rows: Vec<PlanStepRow> = plan
            .steps
            .iter()
            .map(|s| PlanStepRow {
                index: s.index,
                action: Self::format_action(s.action),
                resource: s.node_id.clone(),
                kind: s.kind.clone(),
                after: s
                    .dependencies
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                reason: if detailed {
                    s.reason.clone()
                } else {
                    Self::truncate(&s.reason, 40)
                },
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let changes = &plan.changes;
        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete",
            changes.creates().to_string().green(),
            changes.updates().to_string().yellow(),
            changes.replaces().to_string().magenta(),
            changes.deletes().to_string().red()
        );

        if plan.has_destructive_steps() {
            let _ = writeln!(
                output,
                "\n{} This plan deletes cloud resources.",
                "⚠".yellow()
            );
        }

        output
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_run(&self, result: &RunResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => Self::format_run_text(result),
        }
    }

    fn format_run_text(result: &RunResult) -> String {
        let report = &result.report;
        let mut output = String::new();

        if !report.results.is_empty() {
            let rows: Vec<StepResultRow> = report
                .results
                .iter()
                .map(|r| StepResultRow {
                    index: r.index,
                    action: Self::format_action(r.action),
                    resource: r.node_id.clone(),
                    status: Self::format_step_status(r.status),
                    physical_id: r.physical_id.clone().unwrap_or_default(),
                    attempts: r.attempts,
                })
                .collect();
            output.push_str(&Table::new(rows).to_string());
            output.push_str("\n\n");
        }

        let status = if result.is_success() {
            format!("{} {} complete", "✓".green(), result.operation)
        } else if report.cancelled {
            format!("{} {} cancelled", "⚠".yellow(), result.operation)
        } else {
            format!("{} {} partially failed", "✗".red(), result.operation)
        };
        let _ = writeln!(output, "{status}");
        let _ = writeln!(
            output,
            "   Succeeded: {}  Failed: {}  Skipped: {}",
            report.succeeded(),
            report.failed(),
            report.skipped()
        );

        let failures: Vec<_> = report
            .results
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .collect();
        if !failures.is_empty() {
            let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
            for failure in failures {
                let _ = writeln!(
                    output,
                    "   - {} {}: {}",
                    failure.action,
                    failure.node_id,
                    failure.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        if !result.outputs.is_empty() {
            output.push_str("\nOutputs:\n");
            output.push_str(&Self::outputs_text(&result.outputs));
        }

        output
    }

    /// Formats stack outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => to_json(outputs),
            OutputFormat::Text if outputs.is_empty() => String::from("No outputs available.\n"),
            OutputFormat::Text => Self::outputs_text(outputs),
        }
    }

    fn outputs_text(outputs: &BTreeMap<String, Value>) -> String {
        let mut output = String::new();
        for (name, value) in outputs {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let _ = writeln!(output, "   {} = {rendered}", name.bold());
        }
        output
    }

    /// Formats the persisted state.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    state.project, state.environment
                );
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(
                    output,
                    "   Desired hash: {}",
                    ConfigHasher::short_hash(&state.desired_hash)
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .iter()
                        .map(|(id, record)| ResourceRow {
                            id: id.clone(),
                            kind: record.kind.clone(),
                            physical_id: if record.deposed.is_empty() {
                                record.physical_id.clone()
                            } else {
                                format!(
                                    "{} (+{} deposed)",
                                    record.physical_id,
                                    record.deposed.len()
                                )
                            },
                            policy: record.deletion_policy.to_string(),
                            updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "State locked: {} (holder {}, expires in {}s)\n",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn format_message(&self, status: MessageStatus, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                to_json(&serde_json::json!({ "status": status, "message": message }))
            }
            OutputFormat::Text => {
                let symbol = match status {
                    MessageStatus::Success => "✓".green(),
                    MessageStatus::Warning => "⚠".yellow(),
                    MessageStatus::Error => "✗".red(),
                };
                format!("{symbol} {message}\n")
            }
        }
    }

    /// Formats an action with color.
    fn format_action(action: StepAction) -> String {
        let label = action.to_string();
        match action {
            StepAction::Create => format!("+{label}").green().to_string(),
            StepAction::Update => format!("~{label}").yellow().to_string(),
            StepAction::Delete | StepAction::DestroyForReplace => {
                format!("-{label}").red().to_string()
            }
            StepAction::CleanupDeposed => format!("-{label}").dimmed().to_string(),
        }
    }

    /// Formats a step status with color.
    fn format_step_status(status: StepStatus) -> String {
        match status {
            StepStatus::Succeeded => status.to_string().green().to_string(),
            StepStatus::Failed => status.to_string().red().to_string(),
            StepStatus::Skipped => status.to_string().dimmed().to_string(),
        }
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
}

/// Severity of a one-line message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Operation succeeded.
    Success,
    /// Something needs attention.
    Warning,
    /// Operation failed.
    Error,
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    let mut json = serde_json::to_string_pretty(value).unwrap_or_default();
    json.push('\n');
    json
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_empty_plan_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_plan(&ExecutionPlan::empty("abc"), false);
        assert!(text.contains("No changes required"));
    }

    #[test]
    fn test_json_outputs() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let mut outputs = BTreeMap::new();
        outputs.insert(String::from("ApiUrl"), Value::from("https://api.example.com"));
        let parsed: Value =
            serde_json::from_str(&formatter.format_outputs(&outputs)).expect("valid json");
        assert_eq!(parsed["ApiUrl"], "https://api.example.com");
    }
}
