//! Terminal output: a spinner while a submission runs, plus coloured
//! renderings of responses, review items and contract records.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::collaborators::{ContractRecord, ContractStatus, ReviewItem};
use crate::contract::{Decision, RiskLevel};
use crate::executor::{JobView, ResponseStatus, SubmitResponse};
use crate::state_machine::{JobStatus, ProcessingLogEntry};

/// Spinner shown while a submission is in flight.
pub struct SubmissionProgress {
    pb: ProgressBar,
    green: Style,
    yellow: Style,
    red: Style,
}

impl SubmissionProgress {
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("Processing {description}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            yellow: Style::new().yellow().bold(),
            red: Style::new().red().bold(),
        }
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.pb.set_message(message.into());
    }

    /// Stop the spinner and print the response.
    pub fn finish(&self, response: &SubmitResponse) {
        self.pb.finish_and_clear();
        let (mark, style) = match response.status {
            ResponseStatus::Processed => ("✓", &self.green),
            ResponseStatus::Accepted => ("…", &self.yellow),
            ResponseStatus::Failed => ("✗", &self.red),
        };
        println!(
            "  {} {} in {} ms",
            style.apply_to(mark),
            style.apply_to(status_label(response.status)),
            response.processing_time_ms
        );
        print_response(response);
    }

    pub fn finish_quiet(&self) {
        self.pb.finish_and_clear();
    }

    /// Stop the spinner after a rejected submission.
    pub fn abort(&self, reason: &str) {
        self.pb.finish_and_clear();
        println!("  {} {reason}", self.red.apply_to("✗"));
    }
}

fn status_label(status: ResponseStatus) -> &'static str {
    match status {
        ResponseStatus::Processed => "processed",
        ResponseStatus::Accepted => "accepted (still running)",
        ResponseStatus::Failed => "failed",
    }
}

fn decision_style(decision: Decision) -> Style {
    match decision {
        Decision::Approved => Style::new().green().bold(),
        Decision::Review => Style::new().yellow().bold(),
    }
}

fn risk_style(risk: RiskLevel) -> Style {
    match risk {
        RiskLevel::Low => Style::new().green(),
        RiskLevel::Medium => Style::new().yellow(),
        RiskLevel::High => Style::new().red(),
    }
}

fn money(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("${v:.2}"))
}

pub fn print_response(response: &SubmitResponse) {
    let dim = Style::new().dim();
    println!("    {} {}", dim.apply_to("contract:"), response.contract_id);
    println!(
        "    {} {}",
        dim.apply_to("decision:"),
        decision_style(response.decision).apply_to(response.decision)
    );
    println!(
        "    {} {}",
        dim.apply_to("risk:    "),
        risk_style(response.risk_level).apply_to(response.risk_level)
    );
    if let Some(error) = &response.error {
        let retry = if error.retriable { " (retriable)" } else { "" };
        println!("    {} {error}{retry}", dim.apply_to("error:   "));
    }
}

/// Print the final state of a job that outlived the synchronous wait.
pub fn print_job(view: &JobView) {
    let dim = Style::new().dim();
    let header = Style::new().cyan().bold();
    println!();
    println!("{}", header.apply_to(format!("─── Job {} ───", view.request_id)));
    println!("    {} {:?}", dim.apply_to("status:  "), view.status);
    if let Some(outcome) = &view.outcome {
        println!("    {} {}", dim.apply_to("contract:"), outcome.contract_record_id);
        println!(
            "    {} {}",
            dim.apply_to("decision:"),
            decision_style(outcome.decision).apply_to(outcome.decision)
        );
        for reason in &outcome.reasons {
            println!("      - {reason}");
        }
    }
    if let Some(record) = &view.contract {
        println!("    {} {} ({})", dim.apply_to("contract:"), record.id, record.status);
    }
    if let Some(failure) = &view.failure {
        println!("    {} {failure}", dim.apply_to("error:   "));
    }
}

pub fn print_review_queue(items: &[ReviewItem]) {
    if items.is_empty() {
        println!("Review queue is empty.");
        return;
    }
    let header = Style::new().bold();
    println!(
        "{}",
        header.apply_to(format!(
            "{:<42} {:<28} {:>14} {:<6} {}",
            "CONTRACT", "VENDOR", "VALUE", "RISK", "VIOLATIONS"
        ))
    );
    for item in items {
        let violations: Vec<&str> = item.violations.iter().map(|v| v.code.as_str()).collect();
        println!(
            "{:<42} {:<28} {:>14} {:<6} {}",
            item.contract_id,
            item.vendor_name.as_deref().unwrap_or("-"),
            money(item.total_value),
            risk_style(item.risk_level).apply_to(item.risk_level),
            violations.join(", ")
        );
    }
}

pub fn print_contracts(records: &[ContractRecord]) {
    if records.is_empty() {
        println!("No contracts.");
        return;
    }
    let header = Style::new().bold();
    println!(
        "{}",
        header.apply_to(format!(
            "{:<42} {:<28} {:>14} {:<15} {}",
            "CONTRACT", "VENDOR", "VALUE", "STATUS", "CREATED"
        ))
    );
    for record in records {
        println!(
            "{:<42} {:<28} {:>14} {:<15} {}",
            record.id,
            record.fields.vendor_name.as_deref().unwrap_or("-"),
            money(record.fields.total_value),
            record.status,
            record.created_at.format("%Y-%m-%d %H:%M")
        );
    }
}

/// Print a contract after a reviewer decision.
pub fn print_contract(record: &ContractRecord) {
    let style = match record.status {
        ContractStatus::Approved => Style::new().green().bold(),
        ContractStatus::PendingReview => Style::new().yellow().bold(),
        ContractStatus::Rejected => Style::new().red().bold(),
    };
    println!("{} {}", style.apply_to(record.status), record.id);
    print_json(record);
}

pub fn print_logs(entries: &[ProcessingLogEntry]) {
    if entries.is_empty() {
        println!("Processing log is empty.");
        return;
    }
    for entry in entries {
        let style = match entry.status {
            JobStatus::Completed => Style::new().green(),
            JobStatus::Failed => Style::new().red(),
            _ => Style::new().yellow(),
        };
        let outcome = match (&entry.decision, &entry.failure) {
            (Some(decision), _) => decision.to_string(),
            (None, Some(failure)) => failure.kind.to_string(),
            (None, None) => "-".to_string(),
        };
        println!(
            "{} {:<36} {:<10} {:<8} retries={} {} ms {}",
            entry.completed_at.format("%Y-%m-%d %H:%M:%S"),
            entry.request_id,
            style.apply_to(format!("{:?}", entry.status)),
            entry.final_stage,
            entry.retry_count,
            entry.duration_ms,
            outcome
        );
    }
}

/// Pretty JSON for `--json` output.
pub fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Section header used by the demo.
pub fn print_heading(title: &str) {
    println!();
    println!("{}", Style::new().cyan().bold().apply_to(format!("─── {title} ───")));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_formats_missing_and_present_values() {
        assert_eq!(money(None), "-");
        assert_eq!(money(Some(70_000.0)), "$70000.00");
    }

    #[test]
    fn status_labels_are_distinct() {
        assert_ne!(
            status_label(ResponseStatus::Processed),
            status_label(ResponseStatus::Accepted)
        );
        assert_eq!(status_label(ResponseStatus::Failed), "failed");
    }
}
