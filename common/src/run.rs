use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a run. Variant order is the only legal direction of travel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
}

impl RunStatus {
    /// Map the remote status vocabulary onto the three lifecycle stages.
    /// `waiting`, `requested` and `pending` are all still queued.
    pub fn from_api(s: &str) -> Self {
        match s {
            "in_progress" => RunStatus::InProgress,
            "completed" => RunStatus::Completed,
            _ => RunStatus::Queued,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    Cancelled,
    Skipped,
    None,
}

impl Conclusion {
    pub fn from_api(s: Option<&str>) -> Self {
        match s.unwrap_or("") {
            "" => Conclusion::None,
            "success" => Conclusion::Success,
            "cancelled" => Conclusion::Cancelled,
            "skipped" | "neutral" => Conclusion::Skipped,
            // failure, timed_out, startup_failure, action_required, stale
            _ => Conclusion::Failure,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Cancelled => "cancelled",
            Conclusion::Skipped => "skipped",
            Conclusion::None => "none",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Conclusion::Success)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Success,
    Failure,
    Skipped,
    InProgress,
    Pending,
}

impl StepState {
    /// A step reports its conclusion once it has one, its status before that.
    pub fn from_api(status: Option<&str>, conclusion: Option<&str>) -> Self {
        let effective = conclusion
            .filter(|c| !c.is_empty())
            .or(status)
            .unwrap_or("");
        match effective {
            "success" => StepState::Success,
            "failure" => StepState::Failure,
            "skipped" => StepState::Skipped,
            "in_progress" => StepState::InProgress,
            _ => StepState::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepStatus {
    pub name: String,
    pub state: StepState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatus {
    pub name: String,
    pub steps: Vec<StepStatus>,
}

/// One entry of the recent-runs listing, also the shape of a single run read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub id: RunId,
    pub run_number: u64,
    pub status: RunStatus,
    pub conclusion: Conclusion,
    /// `None` when the remote timestamp could not be parsed.
    pub created_at: Option<DateTime<Utc>>,
}

/// Immutable point-in-time view of a run and its steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub run_number: u64,
    pub status: RunStatus,
    pub conclusion: Conclusion,
    pub created_at: Option<DateTime<Utc>>,
    pub html_url: String,
    pub jobs: Vec<JobStatus>,
}

impl RunSnapshot {
    pub fn new(run: RunSummary, html_url: String, jobs: Vec<JobStatus>) -> Self {
        // conclusion only means something once the run is over
        let conclusion = if run.status == RunStatus::Completed {
            run.conclusion
        } else {
            Conclusion::None
        };
        Self {
            run_id: run.id,
            run_number: run.run_number,
            status: run.status,
            conclusion,
            created_at: run.created_at,
            html_url,
            jobs,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(status: RunStatus, conclusion: Conclusion) -> RunSummary {
        RunSummary {
            id: RunId(7),
            run_number: 3,
            status,
            conclusion,
            created_at: None,
        }
    }

    #[test]
    fn status_only_orders_forward() {
        assert!(RunStatus::Queued < RunStatus::InProgress);
        assert!(RunStatus::InProgress < RunStatus::Completed);
        assert_eq!(RunStatus::from_api("waiting"), RunStatus::Queued);
        assert_eq!(RunStatus::from_api("requested"), RunStatus::Queued);
        assert_eq!(RunStatus::from_api("in_progress"), RunStatus::InProgress);
        assert_eq!(RunStatus::from_api("completed"), RunStatus::Completed);
    }

    #[test]
    fn conclusion_vocabulary() {
        assert_eq!(Conclusion::from_api(None), Conclusion::None);
        assert_eq!(Conclusion::from_api(Some("success")), Conclusion::Success);
        assert_eq!(Conclusion::from_api(Some("timed_out")), Conclusion::Failure);
        assert_eq!(Conclusion::from_api(Some("cancelled")), Conclusion::Cancelled);
        assert_eq!(Conclusion::from_api(Some("neutral")), Conclusion::Skipped);
    }

    #[test]
    fn step_state_prefers_conclusion() {
        assert_eq!(
            StepState::from_api(Some("completed"), Some("success")),
            StepState::Success
        );
        assert_eq!(
            StepState::from_api(Some("in_progress"), None),
            StepState::InProgress
        );
        assert_eq!(StepState::from_api(Some("queued"), None), StepState::Pending);
        assert_eq!(
            StepState::from_api(Some("completed"), Some("cancelled")),
            StepState::Pending
        );
        assert_eq!(StepState::from_api(None, Some("")), StepState::Pending);
    }

    #[test]
    fn snapshot_hides_conclusion_until_completed() {
        let running = RunSnapshot::new(
            summary(RunStatus::InProgress, Conclusion::Failure),
            String::new(),
            vec![],
        );
        assert_eq!(running.conclusion, Conclusion::None);
        assert!(!running.is_completed());

        let done = RunSnapshot::new(
            summary(RunStatus::Completed, Conclusion::Success),
            String::new(),
            vec![],
        );
        assert_eq!(done.conclusion, Conclusion::Success);
        assert!(done.is_completed());
    }
}
