#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use common::{
    Conclusion, EngineEvent, JobId, JobStatus, RunId, RunSnapshot, RunStatus, RunSummary, StepState,
    StepStatus, TerminalOutcome,
};
use dpr_engine::{
    ClientError, CredentialProvider, Engine, EngineSettings, RemoteJobClient, RepoTarget, Session,
    StaticToken, TargetResolver, Token,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Duration, Instant};

/// Replies handed out in order; the last one repeats forever.
struct Script<T: Clone> {
    queue: VecDeque<T>,
    last: Option<T>,
}

impl<T: Clone> Script<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            queue: items.into(),
            last: None,
        }
    }

    fn next(&mut self) -> Option<T> {
        match self.queue.pop_front() {
            Some(item) => {
                self.last = Some(item.clone());
                Some(item)
            }
            None => self.last.clone(),
        }
    }
}

/// A listed run created `age_secs` before the moment it is listed.
#[derive(Clone)]
pub struct Listed {
    pub id: u64,
    pub age_secs: i64,
}

pub fn listed(id: u64, age_secs: i64) -> Listed {
    Listed { id, age_secs }
}

#[derive(Clone)]
pub struct RunState {
    pub status: RunStatus,
    pub conclusion: Conclusion,
}

pub fn queued() -> RunState {
    RunState {
        status: RunStatus::Queued,
        conclusion: Conclusion::None,
    }
}

pub fn in_progress() -> RunState {
    RunState {
        status: RunStatus::InProgress,
        conclusion: Conclusion::None,
    }
}

pub fn completed(conclusion: Conclusion) -> RunState {
    RunState {
        status: RunStatus::Completed,
        conclusion,
    }
}

pub fn server_error() -> ClientError {
    ClientError::Server {
        status: 502,
        detail: "Bad Gateway".to_string(),
    }
}

pub fn network_error() -> ClientError {
    ClientError::Network("connection reset".to_string())
}

pub fn build_job(state: StepState) -> Vec<JobStatus> {
    vec![JobStatus {
        name: "build".to_string(),
        steps: vec![
            StepStatus {
                name: "checkout".to_string(),
                state: StepState::Success,
            },
            StepStatus {
                name: "fetch papers".to_string(),
                state,
            },
        ],
    }]
}

#[derive(Debug, Clone)]
pub struct DispatchCall {
    pub target: RepoTarget,
    pub job_id: JobId,
    pub git_ref: String,
    pub token: String,
}

pub struct ScriptedClient {
    dispatch: Mutex<Script<Result<(), ClientError>>>,
    lists: Mutex<Script<Result<Vec<Listed>, ClientError>>>,
    runs: Mutex<HashMap<u64, Script<Result<RunState, ClientError>>>>,
    steps: Mutex<Script<Result<Vec<JobStatus>, ClientError>>>,
    login: Mutex<Option<String>>,
    pub dispatches: Mutex<Vec<DispatchCall>>,
    pub list_times: Mutex<Vec<Instant>>,
    pub run_reads: Mutex<Vec<(u64, Instant)>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            dispatch: Mutex::new(Script::new(vec![Ok(())])),
            lists: Mutex::new(Script::new(vec![Ok(vec![])])),
            runs: Mutex::new(HashMap::new()),
            steps: Mutex::new(Script::new(vec![Ok(build_job(StepState::InProgress))])),
            login: Mutex::new(None),
            dispatches: Mutex::new(Vec::new()),
            list_times: Mutex::new(Vec::new()),
            run_reads: Mutex::new(Vec::new()),
        }
    }

    pub fn dispatch_replies(self, replies: Vec<Result<(), ClientError>>) -> Self {
        *self.dispatch.lock().unwrap() = Script::new(replies);
        self
    }

    pub fn lists(self, replies: Vec<Result<Vec<Listed>, ClientError>>) -> Self {
        *self.lists.lock().unwrap() = Script::new(replies);
        self
    }

    pub fn run(self, id: u64, replies: Vec<Result<RunState, ClientError>>) -> Self {
        self.runs.lock().unwrap().insert(id, Script::new(replies));
        self
    }

    pub fn steps(self, replies: Vec<Result<Vec<JobStatus>, ClientError>>) -> Self {
        *self.steps.lock().unwrap() = Script::new(replies);
        self
    }

    pub fn login(self, login: &str) -> Self {
        *self.login.lock().unwrap() = Some(login.to_string());
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_times.lock().unwrap().len()
    }

    pub fn run_calls(&self, id: u64) -> usize {
        self.run_reads
            .lock()
            .unwrap()
            .iter()
            .filter(|(run, _)| *run == id)
            .count()
    }

    pub fn run_read_times(&self, id: u64) -> Vec<Instant> {
        self.run_reads
            .lock()
            .unwrap()
            .iter()
            .filter(|(run, _)| *run == id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteJobClient for ScriptedClient {
    async fn dispatch(&self, session: &Session, job_id: &JobId, git_ref: &str) -> Result<(), ClientError> {
        self.dispatches.lock().unwrap().push(DispatchCall {
            target: session.target.clone(),
            job_id: job_id.clone(),
            git_ref: git_ref.to_string(),
            token: session.token.expose().to_string(),
        });
        self.dispatch.lock().unwrap().next().unwrap_or(Ok(()))
    }

    async fn list_recent_runs(&self, _session: &Session, _job_id: &JobId) -> Result<Vec<RunSummary>, ClientError> {
        self.list_times.lock().unwrap().push(Instant::now());
        let reply = self.lists.lock().unwrap().next().unwrap_or(Ok(vec![]))?;
        let now = Utc::now();
        Ok(reply
            .into_iter()
            .map(|run| RunSummary {
                id: RunId(run.id),
                run_number: run.id % 100,
                status: RunStatus::Queued,
                conclusion: Conclusion::None,
                created_at: Some(now - chrono::Duration::seconds(run.age_secs)),
            })
            .collect())
    }

    async fn get_run(&self, _session: &Session, run_id: RunId) -> Result<RunSummary, ClientError> {
        self.run_reads.lock().unwrap().push((run_id.0, Instant::now()));
        let reply = self
            .runs
            .lock()
            .unwrap()
            .get_mut(&run_id.0)
            .and_then(|script| script.next())
            .unwrap_or_else(|| {
                Err(ClientError::NotFound {
                    detail: "Not Found".to_string(),
                })
            })?;
        Ok(RunSummary {
            id: run_id,
            run_number: run_id.0 % 100,
            status: reply.status,
            conclusion: reply.conclusion,
            created_at: Some(Utc::now()),
        })
    }

    async fn get_run_steps(&self, _session: &Session, _run_id: RunId) -> Result<Vec<JobStatus>, ClientError> {
        self.steps.lock().unwrap().next().unwrap_or(Ok(vec![]))
    }

    async fn authenticated_login(&self, _token: &Token) -> Result<String, ClientError> {
        self.login.lock().unwrap().clone().ok_or(ClientError::Unauthorized {
            status: 401,
            detail: "Bad credentials".to_string(),
        })
    }
}

pub fn target() -> RepoTarget {
    RepoTarget::new("octo", "papers")
}

pub fn engine_with(
    client: Arc<ScriptedClient>,
    credentials: Arc<dyn CredentialProvider>,
    targets: TargetResolver,
) -> (Engine, UnboundedReceiver<EngineEvent>) {
    Engine::new(client, credentials, targets, EngineSettings::default())
}

pub fn engine(client: Arc<ScriptedClient>) -> (Engine, UnboundedReceiver<EngineEvent>) {
    engine_with(
        client,
        Arc::new(StaticToken::new("ghp_test")),
        TargetResolver::fixed(target()),
    )
}

/// Collect events up to and including the first terminal one.
pub async fn until_terminal(rx: &mut UnboundedReceiver<EngineEvent>) -> (Vec<EngineEvent>, TerminalOutcome) {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3600), rx.recv())
            .await
            .expect("no terminal event within an hour")
            .expect("engine event channel closed");
        if let EngineEvent::Terminal { outcome } = &event {
            let outcome = outcome.clone();
            events.push(event);
            return (events, outcome);
        }
        events.push(event);
    }
}

/// Collect events up to and including the first snapshot.
pub async fn until_snapshot(rx: &mut UnboundedReceiver<EngineEvent>) -> (Vec<EngineEvent>, RunSnapshot) {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3600), rx.recv())
            .await
            .expect("no snapshot within an hour")
            .expect("engine event channel closed");
        if let EngineEvent::Snapshot { snapshot } = &event {
            let snapshot = snapshot.clone();
            events.push(event);
            return (events, snapshot);
        }
        events.push(event);
    }
}

/// Whatever is already queued, without waiting.
pub fn drain(rx: &mut UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn snapshots(events: &[EngineEvent]) -> Vec<RunSnapshot> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Snapshot { snapshot } => Some(snapshot.clone()),
            _ => None,
        })
        .collect()
}

pub fn status_messages(events: &[EngineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Status { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}
