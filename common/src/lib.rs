pub mod duration;
pub mod event;
pub mod job;
pub mod run;

pub use duration::parse_duration;
pub use event::{EngineEvent, Severity, TerminalOutcome};
pub use job::{Catalog, JobDescriptor, JobId};
pub use run::{
    Conclusion, JobStatus, RunId, RunSnapshot, RunStatus, RunSummary, StepState, StepStatus,
};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_WEB_BASE: &str = "https://github.com";
pub const DEFAULT_GIT_REF: &str = "main";
pub const DEFAULT_TARGET_REPO: &str = "daily-paper-reader";

pub const CONFIG_ENV_VAR: &str = "DPR_CONFIG";
pub const TOKEN_ENV_VAR: &str = "DPR_GITHUB_TOKEN";
pub const USER_CONFIG_DIR: &str = "dpr";
pub const USER_CONFIG_FILE: &str = "config.yaml";
