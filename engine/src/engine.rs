//! Dispatch-and-monitor: trigger a workflow, find the run it produced, and
//! follow that run until it finishes.
//!
//! Each engine watches at most one run. Every trigger, watch or cancel bumps
//! the engine's generation; events from work started under an older
//! generation are dropped, so a superseded task can never publish over the
//! one that replaced it.

use chrono::Utc;
use common::{Conclusion, EngineEvent, JobId, RunId, RunSnapshot, Severity, TerminalOutcome};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::{ClientError, GithubClient, RemoteJobClient, Session};
use crate::config::{Config, PollingConfig};
use crate::correlator::{Correlation, Correlator, DispatchRequest};
use crate::credentials::{CredentialChain, CredentialProvider};
use crate::monitor::{Monitor, MonitorPhase, RefreshOutcome, RunHandle};
use crate::target::TargetResolver;
use crate::until_cancelled;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no GitHub token found; set one in the environment, the secret file or the token file")]
    AuthMissing,
    #[error("could not work out the target repository; set github.owner and github.repo, or github.site_url")]
    RepoUnresolved,
    #[error("dispatch failed: {0}")]
    DispatchFailed(#[source] ClientError),
    #[error("looking up the new run failed: {0}")]
    LookupFailed(#[source] ClientError),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub polling: PollingConfig,
    pub git_ref: String,
    pub web_base: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            polling: PollingConfig::default(),
            git_ref: common::DEFAULT_GIT_REF.to_string(),
            web_base: common::DEFAULT_WEB_BASE.to_string(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            polling: config.polling.clone(),
            git_ref: config.github.git_ref.clone(),
            web_base: config.github.web_base.clone(),
        }
    }
}

struct PublisherState {
    generation: u64,
    events: UnboundedSender<EngineEvent>,
}

/// Event sink guarded by the current generation.
struct Publisher {
    state: Mutex<PublisherState>,
}

impl Publisher {
    fn new(events: UnboundedSender<EngineEvent>) -> Self {
        Self {
            state: Mutex::new(PublisherState {
                generation: 0,
                events,
            }),
        }
    }

    fn advance(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.generation += 1;
        state.generation
    }

    fn current(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Check and send under one lock so nothing slips out after a bump.
    fn publish(&self, generation: u64, event: EngineEvent) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.generation != generation {
            log::debug!("Dropping event from superseded generation {}", generation);
            return false;
        }
        // the receiver going away just means nobody is watching any more
        state.events.send(event).is_ok()
    }
}

struct Inner {
    client: Arc<dyn RemoteJobClient>,
    credentials: Arc<dyn CredentialProvider>,
    targets: TargetResolver,
    settings: EngineSettings,
    correlator: Correlator,
    publisher: Publisher,
    monitor: tokio::sync::Mutex<Monitor>,
}

struct ActiveTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Engine {
    inner: Arc<Inner>,
    active: tokio::sync::Mutex<Option<ActiveTask>>,
}

impl Engine {
    pub fn new(
        client: Arc<dyn RemoteJobClient>,
        credentials: Arc<dyn CredentialProvider>,
        targets: TargetResolver,
        settings: EngineSettings,
    ) -> (Self, UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            correlator: Correlator::from_config(&settings.polling),
            monitor: tokio::sync::Mutex::new(Monitor::new(settings.polling.max_consecutive_failures)),
            publisher: Publisher::new(tx),
            client,
            credentials,
            targets,
            settings,
        };
        let engine = Self {
            inner: Arc::new(inner),
            active: tokio::sync::Mutex::new(None),
        };
        (engine, rx)
    }

    /// Engine talking to the configured GitHub API with the configured
    /// credential chain and target.
    pub fn from_config(config: &Config) -> Result<(Self, UnboundedReceiver<EngineEvent>), ClientError> {
        let client = GithubClient::new(
            &config.github.api_base,
            &config.github.user_agent,
            config.github.request_timeout(),
        )?
        .with_page_sizes(config.polling.runs_per_page, config.polling.jobs_per_page);
        Ok(Self::new(
            Arc::new(client),
            Arc::new(CredentialChain::from_config(&config.credentials)),
            TargetResolver::from_config(&config.github),
            EngineSettings::from_config(config),
        ))
    }

    /// Dispatch `job_id` and follow the run it creates. Whatever this engine
    /// was doing before is cancelled first.
    pub async fn trigger(&self, job_id: JobId) {
        let mut active = self.active.lock().await;
        let generation = self.retire(&mut active).await;
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            inner.dispatch_and_monitor(generation, job_id, token).await;
        });
        *active = Some(ActiveTask { cancel, task });
    }

    /// Follow a run that already exists, skipping dispatch and correlation.
    pub async fn watch(&self, run_id: RunId) {
        let mut active = self.active.lock().await;
        let generation = self.retire(&mut active).await;
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            inner.watch_existing(generation, run_id, token).await;
        });
        *active = Some(ActiveTask { cancel, task });
    }

    /// Stop correlating or polling. Returns once the background task is gone.
    pub async fn cancel(&self) {
        let mut active = self.active.lock().await;
        let generation = self.retire(&mut active).await;
        self.inner.monitor.lock().await.cancel(generation);
    }

    /// Refresh the watched run right away. Does not move the polling schedule.
    pub async fn refresh_now(&self) {
        let generation = self.inner.publisher.current();
        let mut monitor = self.inner.monitor.lock().await;
        if monitor.generation() != generation {
            self.inner.report(generation, RefreshOutcome::NoRun, false);
            return;
        }
        let outcome = monitor.refresh(self.inner.client.as_ref()).await;
        let polling = monitor.is_polling();
        self.inner.report(generation, outcome, polling);
    }

    pub async fn phase(&self) -> MonitorPhase {
        self.inner.monitor.lock().await.phase()
    }

    pub async fn last_snapshot(&self) -> Option<RunSnapshot> {
        self.inner.monitor.lock().await.last_snapshot().cloned()
    }

    async fn retire(&self, active: &mut Option<ActiveTask>) -> u64 {
        let generation = self.inner.publisher.advance();
        if let Some(previous) = active.take() {
            previous.cancel.cancel();
            if let Err(e) = previous.task.await {
                if e.is_panic() {
                    log::error!("Engine task panicked: {}", e);
                }
            }
        }
        generation
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.publisher.advance();
        if let Ok(mut active) = self.active.try_lock() {
            if let Some(task) = active.take() {
                task.cancel.cancel();
                task.task.abort();
            }
        }
    }
}

fn conclusion_severity(conclusion: Conclusion) -> Severity {
    match conclusion {
        Conclusion::Success => Severity::Success,
        Conclusion::Cancelled | Conclusion::Skipped => Severity::Warning,
        Conclusion::Failure | Conclusion::None => Severity::Error,
    }
}

impl Inner {
    fn emit(&self, generation: u64, event: EngineEvent) -> bool {
        self.publisher.publish(generation, event)
    }

    fn status(&self, generation: u64, message: impl Into<String>, severity: Severity) {
        self.emit(generation, EngineEvent::status(message, severity));
    }

    fn terminal(&self, generation: u64, outcome: TerminalOutcome) {
        self.emit(generation, EngineEvent::Terminal { outcome });
    }

    fn fail(&self, generation: u64, error: DispatchError) {
        log::error!("{}", error);
        let message = error.to_string();
        self.status(generation, message.clone(), Severity::Error);
        self.terminal(generation, TerminalOutcome::Failed { message });
    }

    async fn dispatch_and_monitor(self: Arc<Self>, generation: u64, job_id: JobId, cancel: CancellationToken) {
        match self.dispatch_and_correlate(generation, &job_id, &cancel).await {
            Ok(Some(handle)) => self.follow(generation, handle, &cancel).await,
            Ok(None) => {}
            Err(e) => self.fail(generation, e),
        }
    }

    async fn watch_existing(self: Arc<Self>, generation: u64, run_id: RunId, cancel: CancellationToken) {
        match self.open_session(generation, &cancel).await {
            Ok(Some(session)) => {
                self.status(generation, format!("Watching run {} of {}...", run_id, session.target), Severity::Info);
                let handle = self.handle_for(session, run_id);
                self.follow(generation, handle, &cancel).await;
            }
            Ok(None) => {}
            Err(e) => self.fail(generation, e),
        }
    }

    /// Retire the previous run, then resolve token and target. `Ok(None)`
    /// means the attempt was cancelled on the way.
    async fn open_session(&self, generation: u64, cancel: &CancellationToken) -> Result<Option<Session>, DispatchError> {
        match until_cancelled(cancel, self.monitor.lock()).await {
            Some(mut monitor) => monitor.reset(generation),
            None => return Ok(None),
        }

        let token = self.credentials.token().ok_or(DispatchError::AuthMissing)?;
        let target = match until_cancelled(cancel, self.targets.resolve(self.client.as_ref(), &token)).await {
            Some(target) => target.ok_or(DispatchError::RepoUnresolved)?,
            None => return Ok(None),
        };
        Ok(Some(Session { target, token }))
    }

    async fn dispatch_and_correlate(
        &self,
        generation: u64,
        job_id: &JobId,
        cancel: &CancellationToken,
    ) -> Result<Option<RunHandle>, DispatchError> {
        let Some(session) = self.open_session(generation, cancel).await? else {
            return Ok(None);
        };

        let git_ref = self.settings.git_ref.as_str();
        self.status(
            generation,
            format!("Dispatching {} on {}@{}...", job_id, session.target, git_ref),
            Severity::Info,
        );
        match until_cancelled(cancel, self.client.dispatch(&session, job_id, git_ref)).await {
            Some(result) => result.map_err(DispatchError::DispatchFailed)?,
            None => return Ok(None),
        }

        let request = DispatchRequest::new(job_id.clone(), git_ref, Utc::now());
        log::info!(
            "Dispatched {} on {} as {} at {}",
            job_id, session.target, request.id, request.issued_at
        );
        self.status(generation, "Dispatched; waiting for the run to be created...", Severity::Info);

        let correlation = self
            .correlator
            .discover(self.client.as_ref(), &session, &request, cancel)
            .await
            .map_err(DispatchError::LookupFailed)?;

        match correlation {
            Correlation::Found(run) => {
                self.status(
                    generation,
                    format!("Run created: run_id={}, fetching progress...", run.id),
                    Severity::Success,
                );
                Ok(Some(self.handle_for(session, run.id)))
            }
            Correlation::Unconfirmed { attempts } => {
                let actions_url = session.target.actions_url(&self.settings.web_base);
                self.status(
                    generation,
                    format!(
                        "Dispatched, but no matching run appeared after {} lookups. Check {} directly.",
                        attempts, actions_url
                    ),
                    Severity::Warning,
                );
                self.terminal(generation, TerminalOutcome::Unconfirmed { actions_url });
                Ok(None)
            }
            Correlation::Cancelled => Ok(None),
        }
    }

    fn handle_for(&self, session: Session, run_id: RunId) -> RunHandle {
        let html_url = session.target.run_url(&self.settings.web_base, run_id);
        RunHandle {
            session,
            run_id,
            html_url,
        }
    }

    /// Refresh once right away, then on every tick until the monitor stops
    /// or `cancel` fires.
    async fn follow(&self, generation: u64, handle: RunHandle, cancel: &CancellationToken) {
        {
            let Some(mut monitor) = until_cancelled(cancel, self.monitor.lock()).await else {
                return;
            };
            monitor.attach(generation, handle);
            let Some(outcome) = until_cancelled(cancel, monitor.refresh(self.client.as_ref())).await else {
                return;
            };
            let polling = monitor.is_polling();
            self.report(generation, outcome, polling);
            if !polling {
                return;
            }
        }

        let period = self.settings.polling.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if until_cancelled(cancel, ticker.tick()).await.is_none() {
                return;
            }
            let Some(mut monitor) = until_cancelled(cancel, self.monitor.lock()).await else {
                return;
            };
            // a manual refresh may have finished the run in the meantime
            if monitor.generation() != generation || !monitor.is_polling() {
                return;
            }
            let Some(outcome) = until_cancelled(cancel, monitor.refresh(self.client.as_ref())).await else {
                return;
            };
            let polling = monitor.is_polling();
            self.report(generation, outcome, polling);
            if !polling {
                return;
            }
        }
    }

    fn report(&self, generation: u64, outcome: RefreshOutcome, polling: bool) {
        let max = self.settings.polling.max_consecutive_failures;
        match outcome {
            RefreshOutcome::Updated(snapshot) => {
                let message = if polling {
                    format!(
                        "Run #{} {}: refreshing every {}s...",
                        snapshot.run_number,
                        snapshot.status.as_str(),
                        self.settings.polling.interval_secs
                    )
                } else if snapshot.is_completed() {
                    format!(
                        "Run #{} completed: {} (not watching)",
                        snapshot.run_number,
                        snapshot.conclusion.as_str()
                    )
                } else {
                    format!("Run #{} {}", snapshot.run_number, snapshot.status.as_str())
                };
                if self.emit(generation, EngineEvent::Snapshot { snapshot }) {
                    self.status(generation, message, Severity::Progress);
                }
            }
            RefreshOutcome::Completed(snapshot) => {
                let run_id = snapshot.run_id;
                let conclusion = snapshot.conclusion;
                if self.emit(generation, EngineEvent::Snapshot { snapshot }) {
                    self.status(
                        generation,
                        format!("Run finished: {}", conclusion.as_str()),
                        conclusion_severity(conclusion),
                    );
                    self.terminal(generation, TerminalOutcome::Completed { run_id, conclusion });
                }
            }
            RefreshOutcome::Stale { .. } => {}
            RefreshOutcome::Failed { error, consecutive } => {
                let message = if polling {
                    format!("Refresh failed ({}/{}): {}", consecutive, max, error)
                } else {
                    format!("Refresh failed: {}", error)
                };
                self.status(generation, message, Severity::Warning);
            }
            RefreshOutcome::Aborted {
                run_id,
                error,
                consecutive,
            } => {
                let message = format!(
                    "Stopped watching run {} after {} consecutive refresh failures: {}",
                    run_id, consecutive, error
                );
                self.status(generation, message.clone(), Severity::Error);
                self.terminal(generation, TerminalOutcome::Aborted { run_id, message });
            }
            RefreshOutcome::AlreadyFinished(conclusion) => {
                self.status(
                    generation,
                    format!("Run already finished: {}", conclusion.as_str()),
                    Severity::Info,
                );
            }
            RefreshOutcome::NoRun => {
                self.status(generation, "No run to refresh yet.", Severity::Info);
            }
        }
    }
}
