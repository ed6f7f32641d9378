use serde::{Deserialize, Serialize};

/// Identifier of a remote workflow, usually its file name (`sync.yml`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDescriptor {
    pub id: JobId,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

impl JobDescriptor {
    pub fn new(id: &str, display_name: &str, description: &str) -> Self {
        Self {
            id: JobId::from(id),
            display_name: display_name.to_string(),
            description: description.to_string(),
        }
    }
}

/// The static set of workflows an operator may trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    jobs: Vec<JobDescriptor>,
}

impl Catalog {
    pub fn new(jobs: Vec<JobDescriptor>) -> Self {
        Self { jobs }
    }

    pub fn find(&self, id: &str) -> Option<&JobDescriptor> {
        self.jobs.iter().find(|job| job.id.0 == id)
    }

    pub fn jobs(&self) -> &[JobDescriptor] {
        &self.jobs
    }

    pub fn ids(&self) -> Vec<&str> {
        self.jobs.iter().map(|job| job.id.0.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(default_workflows())
    }
}

pub fn default_workflows() -> Vec<JobDescriptor> {
    vec![
        JobDescriptor::new(
            "daily-paper-reader.yml",
            "Fetch and process papers now",
            "Runs the daily-paper-reader workflow (fetch, recall, rerank, generate docs).",
        ),
        JobDescriptor::new(
            "sync.yml",
            "Sync upstream",
            "Runs the Upstream Sync workflow (merge upstream main into this repository).",
        ),
    ]
}
