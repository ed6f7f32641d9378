use anyhow::{bail, Context, Result};
use common::{Catalog, JobDescriptor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GithubConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_web_base")]
    pub web_base: String,
    pub owner: Option<String>,
    pub repo: Option<String>,
    /// Project site address, `https://<owner>.github.io/<repo>/`.
    pub site_url: Option<String>,
    #[serde(default = "default_repo")]
    pub default_repo: String,
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String { common::DEFAULT_API_BASE.to_string() }
fn default_web_base() -> String { common::DEFAULT_WEB_BASE.to_string() }
fn default_repo() -> String { common::DEFAULT_TARGET_REPO.to_string() }
fn default_git_ref() -> String { common::DEFAULT_GIT_REF.to_string() }
fn default_user_agent() -> String { format!("dpr/{}", env!("CARGO_PKG_VERSION")) }
fn default_request_timeout() -> u64 { 30 }

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            web_base: default_web_base(),
            owner: None,
            repo: None,
            site_url: None,
            default_repo: default_repo(),
            git_ref: default_git_ref(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl GithubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_correlation_attempts")]
    pub correlation_attempts: u32,
    #[serde(default = "default_grace_window")]
    pub grace_window_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_runs_per_page")]
    pub runs_per_page: u32,
    #[serde(default = "default_jobs_per_page")]
    pub jobs_per_page: u32,
}

fn default_interval() -> u64 { 5 }
fn default_correlation_attempts() -> u32 { 18 }
fn default_grace_window() -> u64 { 5 }
fn default_max_failures() -> u32 { 3 }
fn default_runs_per_page() -> u32 { 10 }
fn default_jobs_per_page() -> u32 { 100 }

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            correlation_attempts: default_correlation_attempts(),
            grace_window_secs: default_grace_window(),
            max_consecutive_failures: default_max_failures(),
            runs_per_page: default_runs_per_page(),
            jobs_per_page: default_jobs_per_page(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsConfig {
    #[serde(default = "default_token_env_var")]
    pub env_var: String,
    /// JSON document `{"github": {"token": "..."}}`.
    pub secret_file: Option<PathBuf>,
    /// JSON document `{"token": "..."}`.
    pub token_file: Option<PathBuf>,
}

fn default_token_env_var() -> String { common::TOKEN_ENV_VAR.to_string() }

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            env_var: default_token_env_var(),
            secret_file: None,
            token_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String { "UTC".to_string() }

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default = "common::job::default_workflows")]
    pub workflows: Vec<JobDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github: GithubConfig::default(),
            polling: PollingConfig::default(),
            credentials: CredentialsConfig::default(),
            logging: LoggingConfig::default(),
            display: DisplayConfig::default(),
            workflows: common::job::default_workflows(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Detect file type by extension and load
    pub fn from_file(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match ext {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => bail!("Unsupported config file format. Use .yaml, .yml, or .toml"),
        }
    }

    /// `$DPR_CONFIG`, else `~/.config/dpr/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(common::CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        dirs::config_dir().map(|dir| dir.join(common::USER_CONFIG_DIR).join(common::USER_CONFIG_FILE))
    }

    /// The file `load` reads: `explicit` if given, else the default path if
    /// it exists. `None` means built-in defaults only.
    pub fn source_path(explicit: Option<&Path>) -> Option<PathBuf> {
        match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        }
    }

    /// Load `explicit` if given (it must exist), otherwise the default path
    /// if present, otherwise built-in defaults. The result is validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();
        if let Some(path) = Self::source_path(explicit) {
            config.merge(Self::from_file(&path)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Merge with another config, preferring values from other
    pub fn merge(&mut self, other: Config) {
        self.github.api_base = other.github.api_base;
        self.github.web_base = other.github.web_base;
        if other.github.owner.is_some() {
            self.github.owner = other.github.owner;
        }
        if other.github.repo.is_some() {
            self.github.repo = other.github.repo;
        }
        if other.github.site_url.is_some() {
            self.github.site_url = other.github.site_url;
        }
        self.github.default_repo = other.github.default_repo;
        self.github.git_ref = other.github.git_ref;
        self.github.user_agent = other.github.user_agent;
        self.github.request_timeout_secs = other.github.request_timeout_secs;

        self.polling = other.polling;

        self.credentials.env_var = other.credentials.env_var;
        if other.credentials.secret_file.is_some() {
            self.credentials.secret_file = other.credentials.secret_file;
        }
        if other.credentials.token_file.is_some() {
            self.credentials.token_file = other.credentials.token_file;
        }

        self.logging.level = other.logging.level;
        if other.logging.output.is_some() {
            self.logging.output = other.logging.output;
        }

        self.display = other.display;

        // Workflows - replace
        self.workflows = other.workflows;
    }

    pub fn validate(&self) -> Result<()> {
        let polling = &self.polling;
        if polling.interval_secs == 0 {
            bail!("polling.interval_secs must be greater than zero");
        }
        if polling.correlation_attempts == 0 {
            bail!("polling.correlation_attempts must be greater than zero");
        }
        if polling.max_consecutive_failures == 0 {
            bail!("polling.max_consecutive_failures must be greater than zero");
        }
        if polling.runs_per_page == 0 || polling.jobs_per_page == 0 {
            bail!("polling page sizes must be greater than zero");
        }
        if self.github.git_ref.trim().is_empty() {
            bail!("github.git_ref must not be empty");
        }
        self.display
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("display.timezone: {}", e))?;

        if self.workflows.is_empty() {
            bail!("at least one workflow must be configured");
        }
        let mut seen = std::collections::HashSet::new();
        for wf in &self.workflows {
            if wf.id.0.trim().is_empty() {
                bail!("workflow ids must not be empty");
            }
            if !seen.insert(wf.id.0.as_str()) {
                bail!("duplicate workflow id: {}", wf.id);
            }
        }
        Ok(())
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.workflows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(name: &str, content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn defaults_match_the_dashboard() {
        let config = Config::default();
        assert_eq!(config.polling.interval(), Duration::from_secs(5));
        assert_eq!(config.polling.correlation_attempts, 18);
        assert_eq!(config.polling.grace_window(), Duration::from_secs(5));
        assert_eq!(config.polling.max_consecutive_failures, 3);
        assert_eq!(config.github.git_ref, "main");
        assert_eq!(config.catalog().ids(), vec!["daily-paper-reader.yml", "sync.yml"]);
        config.validate().unwrap();
    }

    #[test]
    fn yaml_overrides_and_keeps_defaults() {
        let (_dir, path) = write_config(
            "config.yaml",
            "github:\n  owner: octo\n  repo: papers\npolling:\n  interval_secs: 10\n",
        );
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.github.owner.as_deref(), Some("octo"));
        assert_eq!(config.polling.interval_secs, 10);
        assert_eq!(config.polling.correlation_attempts, 18);
        assert_eq!(config.workflows.len(), 2);
    }

    #[test]
    fn toml_is_supported() {
        let (_dir, path) = write_config(
            "config.toml",
            "[github]\ngit_ref = \"dev\"\n\n[[workflows]]\nid = \"nightly.yml\"\ndisplay_name = \"Nightly\"\n",
        );
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.github.git_ref, "dev");
        assert_eq!(config.catalog().ids(), vec!["nightly.yml"]);
    }

    #[test]
    fn unknown_extension_and_missing_explicit_file_fail() {
        let (_dir, path) = write_config("config.ini", "x=1");
        assert!(Config::from_file(&path).is_err());
        assert!(Config::load(Some(Path::new("/nonexistent/dpr.yaml"))).is_err());
    }

    #[test]
    fn explicit_path_is_the_source_even_if_missing() {
        let missing = Path::new("/nonexistent/dpr.yaml");
        assert_eq!(Config::source_path(Some(missing)), Some(missing.to_path_buf()));

        let (_dir, path) = write_config("config.yaml", "polling:\n  interval_secs: 7\n");
        assert_eq!(Config::source_path(Some(&path)), Some(path.clone()));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.polling.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.display.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.workflows.push(JobDescriptor::new("sync.yml", "again", ""));
        assert!(config.validate().is_err());
    }
}
