//! Finding the run a dispatch created.
//!
//! The dispatch call does not return a run id, so the run is inferred from
//! the recent-runs listing: the newest run created no earlier than the
//! dispatch time minus a grace window is taken to be ours. Two dispatches of
//! the same workflow inside that window can be told apart by nothing the
//! remote returns, so the newer one wins for both.

use chrono::{DateTime, Utc};
use common::{JobId, RunSummary};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{ClientError, RemoteJobClient, Session};
use crate::config::PollingConfig;
use crate::until_cancelled;

/// One trigger action, stamped once the remote accepted it.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub id: Uuid,
    pub job_id: JobId,
    pub git_ref: String,
    pub issued_at: DateTime<Utc>,
}

impl DispatchRequest {
    pub fn new(job_id: JobId, git_ref: &str, issued_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            git_ref: git_ref.to_string(),
            issued_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    Found(RunSummary),
    /// Budget spent without a match. The run may still exist.
    Unconfirmed { attempts: u32 },
    Cancelled,
}

/// First run, in the listing's newest-first order, created at or after
/// `issued_at - grace`. Runs without a readable timestamp never match.
pub fn select_run(runs: &[RunSummary], issued_at: DateTime<Utc>, grace: Duration) -> Option<&RunSummary> {
    let earliest = issued_at - chrono::Duration::milliseconds(grace.as_millis() as i64);
    runs.iter().find(|run| run.created_at.is_some_and(|t| t >= earliest))
}

pub struct Correlator {
    attempts: u32,
    interval: Duration,
    grace: Duration,
}

impl Correlator {
    pub fn new(attempts: u32, interval: Duration, grace: Duration) -> Self {
        Self {
            attempts,
            interval,
            grace,
        }
    }

    pub fn from_config(polling: &PollingConfig) -> Self {
        Self::new(polling.correlation_attempts, polling.interval(), polling.grace_window())
    }

    /// Poll the recent-runs listing until a run matches `request`, the
    /// attempt budget runs out, or `cancel` fires. Transient listing failures
    /// use up an attempt; any other failure ends the search.
    pub async fn discover(
        &self,
        client: &dyn RemoteJobClient,
        session: &Session,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Correlation, ClientError> {
        for attempt in 1..=self.attempts {
            let listed = match until_cancelled(cancel, client.list_recent_runs(session, &request.job_id)).await {
                Some(listed) => listed,
                None => return Ok(Correlation::Cancelled),
            };

            match listed {
                Ok(runs) => {
                    if let Some(run) = select_run(&runs, request.issued_at, self.grace) {
                        log::info!(
                            "Dispatch {} of {} matched run {} on attempt {}",
                            request.id, request.job_id, run.id, attempt
                        );
                        return Ok(Correlation::Found(run.clone()));
                    }
                    log::debug!(
                        "Dispatch {}: no matching run among {} listed (attempt {}/{})",
                        request.id, runs.len(), attempt, self.attempts
                    );
                }
                Err(e) if e.is_transient() => {
                    log::warn!(
                        "Dispatch {}: listing runs failed (attempt {}/{}): {}",
                        request.id, attempt, self.attempts, e
                    );
                }
                Err(e) => return Err(e),
            }

            if attempt < self.attempts
                && until_cancelled(cancel, tokio::time::sleep(self.interval)).await.is_none()
            {
                return Ok(Correlation::Cancelled);
            }
        }

        log::warn!(
            "Dispatch {} of {}: no run found after {} attempts",
            request.id, request.job_id, self.attempts
        );
        Ok(Correlation::Unconfirmed {
            attempts: self.attempts,
        })
    }
}
