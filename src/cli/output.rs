//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; the caller decides where it goes. JSON
//! output never hides sensitive values, text output shows `(sensitive)`
//! unless asked otherwise.

use colored::Colorize;
use serde_json::json;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::graph::DependencyGraph;
use crate::model::json_to_text;
use crate::outputs::{OutputSet, OutputValue};
use crate::planner::{ActionKind, ActionStatus, ExecutionReport, Plan, ReplacePhase};
use crate::state::{LockInfo, StateDocument};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Action outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Time")]
    duration: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// State entry row for table display.
#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Updated")]
    updated: String,
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
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. Infrastructure matches the configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nExecution plan");
        let _ = writeln!(output, "   Config hash: {}\n", Self::short(&plan.config_hash));

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.kind.is_change())
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_kind(a.kind),
                resource: a.resource.to_string(),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanged attributes:\n");
            for action in plan.actions.iter().filter(|a| !a.changed.is_empty()) {
                let _ = writeln!(output, "   {}: {}", action.resource, action.changed.join(", "));
            }
        }

        let summary = plan.summary();
        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy.",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.destroy.to_string().red()
        );
        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_report(
        &self,
        report: &ExecutionReport,
        outputs: &OutputSet,
        show_sensitive: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&json!({
                "success": report.is_success(),
                "report": report,
                "outputs": outputs,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let rows: Vec<OutcomeRow> = report
                    .outcomes
                    .iter()
                    .filter(|o| o.kind.is_change())
                    .map(|o| OutcomeRow {
                        resource: o.resource.to_string(),
                        action: o.kind.to_string(),
                        status: Self::format_status(o.status),
                        duration: format!("{}ms", o.duration_ms),
                        detail: o
                            .error
                            .as_deref()
                            .or(o.provider_id.as_deref())
                            .map(|s| Self::truncate(s, 60))
                            .unwrap_or_default(),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let headline = if report.is_success() {
                    format!("{} Run complete", "✓".green())
                } else {
                    format!("{} Run incomplete", "✗".red())
                };
                let _ = writeln!(
                    output,
                    "\n{headline}: {} succeeded, {} failed, {} skipped, {} cancelled.",
                    report.succeeded(),
                    report.failed(),
                    report.skipped(),
                    report.cancelled()
                );
                if let Some(reason) = &report.cancelled_reason {
                    let _ = writeln!(output, "   Cancelled: {reason}");
                }

                if !outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    output.push_str(&Self::format_outputs_text(outputs, None, show_sensitive));
                }
                output
            }
        }
    }

    /// Formats outputs, optionally a single one.
    #[must_use]
    pub fn format_outputs(&self, outputs: &OutputSet, name: Option<&str>, show_sensitive: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let value = match name {
                    Some(name) => json!(outputs.get(name)),
                    None => json!(outputs),
                };
                serde_json::to_string_pretty(&value).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_outputs_text(outputs, name, show_sensitive),
        }
    }

    fn format_outputs_text(outputs: &OutputSet, name: Option<&str>, show_sensitive: bool) -> String {
        let mut output = String::new();
        for (key, value, sensitive) in outputs.iter() {
            if name.is_some_and(|n| n != key) {
                continue;
            }
            let shown = match value {
                OutputValue::Available { .. } if sensitive && !show_sensitive => {
                    "(sensitive)".dimmed().to_string()
                }
                OutputValue::Available { value } => json_to_text(value),
                OutputValue::Unavailable { reason } => {
                    format!("{} ({reason})", "unavailable".yellow())
                }
            };
            if name.is_some() {
                let _ = writeln!(output, "{shown}");
            } else {
                let _ = writeln!(output, "   {key} = {shown}");
            }
        }
        output
    }

    /// Formats a state summary.
    #[must_use]
    pub fn format_state(&self, state: &StateDocument) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState: {}/{}\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.entries.len());
                for (status, count) in state.status_counts() {
                    let _ = writeln!(output, "     {status}: {count}");
                }
                let _ = writeln!(output, "   Data sources: {}", state.data.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent runs ({}):", state.history.len());
                    for run in state.history.iter().rev().take(5) {
                        let mark = if run.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {mark} {} {} ({} ok, {} failed, {} skipped, {} cancelled)",
                            run.finished_at.format("%Y-%m-%d %H:%M"),
                            run.operation,
                            run.succeeded,
                            run.failed,
                            run.skipped,
                            run.cancelled
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats the recorded resources.
    #[must_use]
    pub fn format_state_list(&self, state: &StateDocument) -> String {
        match self.format {
            OutputFormat::Json => {
                let entries: Vec<_> = state
                    .entries
                    .values()
                    .map(|e| {
                        json!({
                            "resource": e.id.to_string(),
                            "status": e.status,
                            "provider_id": e.provider_id,
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&entries).unwrap_or_default()
            }
            OutputFormat::Text => {
                if state.entries.is_empty() {
                    return String::from("No resources in state.\n");
                }
                let rows: Vec<EntryRow> = state
                    .entries
                    .values()
                    .map(|e| EntryRow {
                        resource: e.id.to_string(),
                        status: e.status.to_string(),
                        id: e.provider_id.clone().unwrap_or_else(|| String::from("-")),
                        updated: e.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a lock.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(lock).unwrap_or_default(),
            OutputFormat::Text => format!(
                "State locked: {} by {} ({}s remaining)\n",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats the dependency graph.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph) -> String {
        let order: Vec<String> = graph.topological_order().map(ToString::to_string).collect();
        let edges: Vec<(String, String)> = graph
            .edges()
            .into_iter()
            .map(|(node, dep)| (node.to_string(), dep.to_string()))
            .collect();

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&json!({
                "order": order,
                "edges": edges
                    .iter()
                    .map(|(node, dep)| json!({ "resource": node, "depends_on": dep }))
                    .collect::<Vec<_>>(),
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::from("Creation order:\n");
                for (i, id) in order.iter().enumerate() {
                    let _ = writeln!(output, "   {}. {id}", i + 1);
                }
                if !edges.is_empty() {
                    output.push_str("\nDependencies:\n");
                    for (node, dep) in &edges {
                        let _ = writeln!(output, "   {node} -> {dep}");
                    }
                }
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&json!({
                "valid": result.is_valid(),
                "errors": result
                    .errors
                    .iter()
                    .map(|e| json!({ "field": e.field, "message": e.message }))
                    .collect::<Vec<_>>(),
                "warnings": result.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid.\n", "✓".green())
                } else {
                    format!("{} Configuration is invalid:\n", "✗".red())
                };
                for error in &result.errors {
                    let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats an action kind with color.
    fn format_action_kind(kind: ActionKind) -> String {
        match kind {
            ActionKind::Create => "+create".green().to_string(),
            ActionKind::Update => "~update".yellow().to_string(),
            ActionKind::Replace(ReplacePhase::DestroyOld) => "-/+destroy".red().to_string(),
            ActionKind::Replace(ReplacePhase::CreateNew) => "-/+create".green().to_string(),
            ActionKind::Destroy => "-destroy".red().to_string(),
            ActionKind::Noop => "noop".dimmed().to_string(),
        }
    }

    /// Formats an action status with color.
    fn format_status(status: ActionStatus) -> String {
        match status {
            ActionStatus::Succeeded => "succeeded".green().to_string(),
            ActionStatus::Failed => "failed".red().to_string(),
            ActionStatus::Skipped => "skipped".yellow().to_string(),
            ActionStatus::Cancelled => "cancelled".yellow().to_string(),
        }
    }

    fn short(hash: &str) -> &str {
        hash.get(..8).unwrap_or(hash)
    }

    /// Truncates a string to at most `max_len` characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}
