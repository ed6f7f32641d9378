//! Trigger remote workflows and follow the runs they create.

pub mod client;
pub mod config;
pub mod correlator;
pub mod credentials;
pub mod engine;
pub mod monitor;
pub mod target;

pub use client::{ClientError, GithubClient, RemoteJobClient, Session};
pub use config::Config;
pub use correlator::{select_run, Correlation, Correlator, DispatchRequest};
pub use credentials::{CredentialChain, CredentialProvider, StaticToken, Token};
pub use engine::{DispatchError, Engine, EngineSettings};
pub use monitor::{Monitor, MonitorPhase, RefreshOutcome, RunHandle, StopReason};
pub use target::{RepoTarget, TargetResolver};

use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Run `fut` unless `cancel` fires first. Cancellation wins a tie.
pub(crate) async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
