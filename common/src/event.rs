use serde::{Deserialize, Serialize};

use crate::run::{Conclusion, RunId, RunSnapshot};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Progress,
    Success,
    Warning,
    Error,
}

/// How a dispatch-and-monitor attempt ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalOutcome {
    /// The run reached `completed`.
    Completed { run_id: RunId, conclusion: Conclusion },
    /// Dispatch was accepted but no matching run showed up in time.
    Unconfirmed { actions_url: String },
    /// Polling gave up after repeated refresh failures.
    Aborted { run_id: RunId, message: String },
    /// The attempt never got as far as a run.
    Failed { message: String },
}

impl TerminalOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TerminalOutcome::Completed {
                conclusion: Conclusion::Success,
                ..
            }
        )
    }
}

/// Everything the presentation side receives from an engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Status { message: String, severity: Severity },
    Snapshot { snapshot: RunSnapshot },
    Terminal { outcome: TerminalOutcome },
}

impl EngineEvent {
    pub fn status(message: impl Into<String>, severity: Severity) -> Self {
        EngineEvent::Status {
            message: message.into(),
            severity,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineEvent::Terminal { .. })
    }
}
