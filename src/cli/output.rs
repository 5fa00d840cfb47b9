//! Output formatting for CLI commands.
//!
//! This module renders reports, plans, validation results and lock
//! information as coloured text tables or as JSON.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ContentHasher, ValidationResult};
use crate::planner::{Action, ActionKind, Plan};
use crate::report::{LockInfo, OutcomeStatus, Report};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Actions")]
    actions: String,
    #[tabled(rename = "Detail")]
    detail: String,
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

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &Report) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &Report) -> String {
        let mut output = String::new();

        let _ = write!(
            output,
            "\n{} {} on {} (run {})\n",
            "▶".cyan(),
            report.mode.to_string().bold(),
            report.target,
            &report.run_id.to_string()[..8]
        );
        let _ = writeln!(
            output,
            "   Declaration: {}\n",
            ContentHasher::short_hash(&report.declaration_hash)
        );

        if report.outcomes.is_empty() {
            output.push_str("   No resources declared.\n");
        } else {
            let rows: Vec<OutcomeRow> = report
                .outcomes
                .iter()
                .map(|o| OutcomeRow {
                    resource: o.resource.clone(),
                    kind: o.kind.to_string(),
                    status: Self::format_status(o.status),
                    actions: if o.actions.is_empty() {
                        String::from("-")
                    } else {
                        o.actions.join(", ")
                    },
                    detail: Self::truncate(&o.detail, 60),
                })
                .collect();

            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if !report.restarts.is_empty() {
            let _ = writeln!(output, "\n   Restarted: {}", report.restarts.join(", "));
        }

        if let Some(reason) = &report.abort_reason {
            let _ = writeln!(output, "\n{} Run aborted: {reason}", "✗".red());
        }

        let summary = report.summary();
        let _ = write!(
            output,
            "\nResult: {} ({} pass, {} warn, {} fail, {} skipped), exit code {}\n",
            Self::format_status(report.overall()),
            summary.pass.to_string().green(),
            summary.warn.to_string().yellow(),
            summary.fail.to_string().red(),
            summary.skipped,
            report.exit_code()
        );

        output
    }

    /// Formats a dry-run plan.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - {} is converged.\n",
                "✓".green(),
                plan.target
            );
        }

        let mut output = String::new();

        let title = if plan.teardown {
            "Teardown Plan"
        } else {
            "Convergence Plan"
        };
        let _ = writeln!(output, "\n{} {title}: {}", "📋".cyan(), plan.target);
        let _ = writeln!(
            output,
            "   Declaration: {}\n",
            ContentHasher::short_hash(&plan.declaration_hash)
        );

        let mut rows = Vec::new();
        for entry in &plan.entries {
            let reason = if entry.mismatches.is_empty() {
                String::from("absent")
            } else {
                entry
                    .mismatches
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            for action in &entry.actions {
                rows.push(PlanActionRow {
                    index: rows.len() + 1,
                    action: Self::format_action(action),
                    resource: format!("{}/{}", entry.kind, entry.resource),
                    reason: Self::truncate(&reason, 50),
                });
            }
        }

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        for entry in &plan.entries {
            if let Some(error) = &entry.error {
                let _ = writeln!(output, "{} {}: {error}", "✗".red(), entry.resource);
            }
            if !entry.unobservable.is_empty() {
                let _ = writeln!(
                    output,
                    "{} {}: cannot observe {}",
                    "⚠".yellow(),
                    entry.resource,
                    entry.unobservable.join(", ")
                );
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to install, {} to configure, {} to start/stop, {} to uninstall\n",
            plan.count_of(ActionKind::Install).to_string().green(),
            plan.count_of(ActionKind::Configure).to_string().yellow(),
            (plan.count_of(ActionKind::Start)
                + plan.count_of(ActionKind::Stop)
                + plan.count_of(ActionKind::Restart))
            .to_string()
            .yellow(),
            plan.count_of(ActionKind::Uninstall).to_string().red()
        );

        output
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "errors": result
                        .errors
                        .iter()
                        .map(|e| serde_json::json!({ "field": e.field, "message": e.message }))
                        .collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Declaration is valid!", "✓".green());
                } else {
                    let _ = writeln!(
                        output,
                        "{} Declaration has {} error(s):",
                        "✗".red(),
                        result.errors.len()
                    );
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
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

    /// Formats the current run lock.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&lock).unwrap_or_default(),
            OutputFormat::Text => match lock {
                None => String::from("No run lock held.\n"),
                Some(lock) if lock.is_expired() => format!(
                    "Run lock {} held by {} has expired.\n",
                    lock.lock_id, lock.holder
                ),
                Some(lock) => format!(
                    "{} Run lock {} held by {} since {} ({}s left).\n",
                    "🔒".yellow(),
                    lock.lock_id,
                    lock.holder,
                    lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                    lock.remaining_secs()
                ),
            },
        }
    }

    /// Formats an outcome status with color.
    fn format_status(status: OutcomeStatus) -> String {
        match status {
            OutcomeStatus::Pass => "PASS".green().to_string(),
            OutcomeStatus::Warn => "WARN".yellow().to_string(),
            OutcomeStatus::Fail => "FAIL".red().bold().to_string(),
        }
    }

    /// Formats an action's operation with color.
    fn format_action(action: &Action) -> String {
        let verb = action.verb();
        match action.kind {
            ActionKind::Install => format!("+{verb}").green().to_string(),
            ActionKind::Configure => format!("~{verb}").yellow().to_string(),
            ActionKind::Start => verb.green().to_string(),
            ActionKind::Stop | ActionKind::Restart => verb.yellow().to_string(),
            ActionKind::Uninstall => format!("-{verb}").red().to_string(),
        }
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
