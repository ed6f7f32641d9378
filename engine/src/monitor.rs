//! State of the one run an engine is watching.

use common::{Conclusion, RunId, RunSnapshot, RunStatus};
use serde::{Deserialize, Serialize};

use crate::client::{ClientError, RemoteJobClient, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed(Conclusion),
    Cancelled,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    Idle,
    Polling,
    Stopped(StopReason),
}

/// The run a dispatch was correlated with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub session: Session,
    pub run_id: RunId,
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// New snapshot of a run that is still going, or of any run once
    /// polling was cancelled or aborted.
    Updated(RunSnapshot),
    /// Final snapshot; the monitor has stopped.
    Completed(RunSnapshot),
    /// The remote reported an earlier status than one already published.
    Stale { reported: RunStatus, published: RunStatus },
    Failed { error: ClientError, consecutive: u32 },
    /// Failure budget spent; the monitor has stopped.
    Aborted { run_id: RunId, error: ClientError, consecutive: u32 },
    AlreadyFinished(Conclusion),
    NoRun,
}

pub struct Monitor {
    generation: u64,
    handle: Option<RunHandle>,
    phase: MonitorPhase,
    max_failures: u32,
    consecutive_failures: u32,
    last: Option<RunSnapshot>,
}

impl Monitor {
    pub fn new(max_failures: u32) -> Self {
        Self {
            generation: 0,
            handle: None,
            phase: MonitorPhase::Idle,
            max_failures: max_failures.max(1),
            consecutive_failures: 0,
            last: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    pub fn handle(&self) -> Option<&RunHandle> {
        self.handle.as_ref()
    }

    pub fn last_snapshot(&self) -> Option<&RunSnapshot> {
        self.last.as_ref()
    }

    pub fn is_polling(&self) -> bool {
        self.phase == MonitorPhase::Polling
    }

    /// Drop whatever run was being watched and go back to idle.
    pub fn reset(&mut self, generation: u64) {
        self.generation = generation;
        self.handle = None;
        self.phase = MonitorPhase::Idle;
        self.consecutive_failures = 0;
        self.last = None;
    }

    pub fn attach(&mut self, generation: u64, handle: RunHandle) {
        log::info!("Watching run {} of {}", handle.run_id, handle.session.target);
        self.reset(generation);
        self.handle = Some(handle);
        self.phase = MonitorPhase::Polling;
    }

    /// Stop polling on the caller's behalf. The handle is kept so a manual
    /// refresh can still look at the run.
    pub fn cancel(&mut self, generation: u64) {
        self.generation = generation;
        if self.phase == MonitorPhase::Polling {
            self.phase = MonitorPhase::Stopped(StopReason::Cancelled);
        }
    }

    pub async fn refresh(&mut self, client: &dyn RemoteJobClient) -> RefreshOutcome {
        let Some(handle) = self.handle.clone() else {
            return RefreshOutcome::NoRun;
        };
        if let MonitorPhase::Stopped(StopReason::Completed(conclusion)) = self.phase {
            return RefreshOutcome::AlreadyFinished(conclusion);
        }

        let run = match client.get_run(&handle.session, handle.run_id).await {
            Ok(run) => run,
            Err(error) => return self.record_failure(handle.run_id, error),
        };
        let jobs = match client.get_run_steps(&handle.session, handle.run_id).await {
            Ok(jobs) => jobs,
            Err(e) => {
                log::warn!("Reading steps of run {} failed, keeping last known: {}", handle.run_id, e);
                self.last.as_ref().map(|s| s.jobs.clone()).unwrap_or_default()
            }
        };
        self.consecutive_failures = 0;

        if let Some(published) = self.last.as_ref().map(|s| s.status) {
            if run.status < published {
                log::debug!(
                    "Run {} reported {} after {}, ignoring",
                    handle.run_id,
                    run.status.as_str(),
                    published.as_str()
                );
                return RefreshOutcome::Stale {
                    reported: run.status,
                    published,
                };
            }
        }

        let snapshot = RunSnapshot::new(run, handle.html_url.clone(), jobs);
        self.last = Some(snapshot.clone());
        // a run stopped by cancel or abort has already had its terminal outcome
        if snapshot.is_completed() && self.is_polling() {
            log::info!("Run {} completed: {}", snapshot.run_id, snapshot.conclusion.as_str());
            self.phase = MonitorPhase::Stopped(StopReason::Completed(snapshot.conclusion));
            RefreshOutcome::Completed(snapshot)
        } else {
            RefreshOutcome::Updated(snapshot)
        }
    }

    fn record_failure(&mut self, run_id: RunId, error: ClientError) -> RefreshOutcome {
        if !self.is_polling() {
            log::warn!("Manual refresh of run {} failed: {}", run_id, error);
            return RefreshOutcome::Failed {
                error,
                consecutive: self.consecutive_failures,
            };
        }

        self.consecutive_failures += 1;
        let consecutive = self.consecutive_failures;
        if consecutive >= self.max_failures {
            log::error!(
                "Refreshing run {} failed {} times in a row, giving up: {}",
                run_id, consecutive, error
            );
            self.phase = MonitorPhase::Stopped(StopReason::Aborted);
            RefreshOutcome::Aborted { run_id, error, consecutive }
        } else {
            log::warn!(
                "Refreshing run {} failed ({}/{}): {}",
                run_id, consecutive, self.max_failures, error
            );
            RefreshOutcome::Failed { error, consecutive }
        }
    }
}
