use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::client::RemoteJobClient;
use crate::config::GithubConfig;
use crate::credentials::Token;
use common::RunId;

const PAGES_HOST_SUFFIX: &str = ".github.io";

/// The repository whose workflows are dispatched and watched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTarget {
    pub owner: String,
    pub repo: String,
}

impl RepoTarget {
    pub fn new(owner: &str, repo: &str) -> Self {
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        }
    }

    pub fn actions_url(&self, web_base: &str) -> String {
        format!("{}/{}/{}/actions", web_base.trim_end_matches('/'), self.owner, self.repo)
    }

    pub fn run_url(&self, web_base: &str, run_id: RunId) -> String {
        format!("{}/runs/{}", self.actions_url(web_base), run_id)
    }

    fn is_complete(&self) -> bool {
        !self.owner.trim().is_empty() && !self.repo.trim().is_empty()
    }
}

impl fmt::Display for RepoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Infer the target from a project site address like
/// `https://octo.github.io/papers/`.
pub fn from_pages_url(url: &str) -> Option<RepoTarget> {
    let url = Url::parse(url).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    let host = url.host_str()?;
    let owner = host.strip_suffix(PAGES_HOST_SUFFIX)?;
    if owner.is_empty() || owner.contains('.') {
        return None;
    }
    let repo = url.path_segments()?.next().filter(|s| !s.is_empty())?;
    Some(RepoTarget::new(owner, repo))
}

/// Works out which repository to talk to, in order: explicit configuration,
/// a project site address, then the token owner's default repository.
#[derive(Debug, Clone, Default)]
pub struct TargetResolver {
    explicit: Option<RepoTarget>,
    site_url: Option<String>,
    default_repo: Option<String>,
}

impl TargetResolver {
    pub fn fixed(target: RepoTarget) -> Self {
        Self {
            explicit: Some(target),
            ..Self::default()
        }
    }

    pub fn from_config(config: &GithubConfig) -> Self {
        let explicit = match (&config.owner, &config.repo) {
            (Some(owner), Some(repo)) => Some(RepoTarget::new(owner, repo)),
            _ => None,
        };
        Self {
            explicit,
            site_url: config.site_url.clone(),
            default_repo: Some(config.default_repo.clone()),
        }
    }

    pub async fn resolve(&self, client: &dyn RemoteJobClient, token: &Token) -> Option<RepoTarget> {
        if let Some(target) = self.explicit.as_ref().filter(|t| t.is_complete()) {
            return Some(target.clone());
        }

        if let Some(target) = self.site_url.as_deref().and_then(from_pages_url) {
            log::debug!("Target {} inferred from site address", target);
            return Some(target);
        }

        let default_repo = self.default_repo.as_deref().filter(|r| !r.trim().is_empty())?;
        match client.authenticated_login(token).await {
            Ok(login) if !login.trim().is_empty() => {
                let target = RepoTarget::new(login.trim(), default_repo);
                log::debug!("Target {} inferred from token owner", target);
                Some(target)
            }
            Ok(_) => None,
            Err(e) => {
                log::warn!("Could not look up token owner: {}", e);
                None
            }
        }
    }
}
