use chrono_tz::Tz;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use common::{Catalog, EngineEvent, RunSnapshot, Severity, StepState, TerminalOutcome};

/// Turns engine events into terminal lines.
pub struct Renderer {
    tz: Tz,
    json: bool,
}

impl Renderer {
    pub fn new(tz: Tz, json: bool) -> Self {
        Self { tz, json }
    }

    pub fn event(&self, event: &EngineEvent) -> String {
        if self.json {
            return serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e));
        }
        match event {
            EngineEvent::Status { message, severity } => format!("[{}] {}", severity_tag(*severity), message),
            EngineEvent::Snapshot { snapshot } => self.snapshot(snapshot),
            EngineEvent::Terminal { outcome } => terminal_line(outcome),
        }
    }

    pub fn snapshot(&self, snapshot: &RunSnapshot) -> String {
        let mut out = format!("Run #{} ({})  {}", snapshot.run_number, snapshot.run_id, snapshot.status.as_str());
        if snapshot.is_completed() {
            out.push_str(&format!(" / {}", snapshot.conclusion.as_str()));
        }
        if let Some(created) = snapshot.created_at {
            out.push_str(&format!(
                "\n  created {}",
                created.with_timezone(&self.tz).format("%Y-%m-%d %H:%M:%S %Z")
            ));
        }
        out.push_str(&format!("\n  {}", snapshot.html_url));
        if snapshot.jobs.is_empty() {
            out.push_str("\n  (no job details yet)");
        }
        for job in &snapshot.jobs {
            out.push_str(&format!("\n  {}", job.name));
            for step in &job.steps {
                out.push_str(&format!("\n    {} {}", step_icon(step.state), step.name));
            }
        }
        out
    }
}

fn severity_tag(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "info",
        Severity::Progress => "....",
        Severity::Success => " ok ",
        Severity::Warning => "warn",
        Severity::Error => "FAIL",
    }
}

fn step_icon(state: StepState) -> &'static str {
    match state {
        StepState::Success => "✅",
        StepState::Failure => "❌",
        StepState::Skipped => "⏭",
        StepState::InProgress => "⏳",
        StepState::Pending => "•",
    }
}

fn terminal_line(outcome: &TerminalOutcome) -> String {
    match outcome {
        TerminalOutcome::Completed { run_id, conclusion } => {
            format!("Done: run {} finished with {}", run_id, conclusion.as_str())
        }
        TerminalOutcome::Unconfirmed { actions_url } => {
            format!("Done: dispatch sent, run not confirmed. See {}", actions_url)
        }
        TerminalOutcome::Aborted { run_id, .. } => format!("Done: gave up watching run {}", run_id),
        TerminalOutcome::Failed { message } => format!("Done: {}", message),
    }
}

pub fn workflows_table(catalog: &Catalog) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["Id", "Name", "Description"]);
    for job in catalog.jobs() {
        table.add_row(vec![job.id.to_string(), job.display_name.clone(), job.description.clone()]);
    }
    table
}
