use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Host selection arguments for job creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostArgs {
    /// Run on exactly these hosts.
    Explicit { hosts: Vec<String> },
    /// Let the inventory pick `count` hosts carrying `meta_host` plus every
    /// dependency label.
    Meta {
        meta_host: String,
        dependencies: Vec<String>,
        count: usize,
    },
}

/// Arguments of a `create_job` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub suite: String,
    pub board: String,
    pub build: String,
    pub pool: Option<String>,
    pub hosts: HostArgs,
    pub timeout_mins: u32,
}

/// A job as stored by the inventory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub suite: String,
    pub board: String,
    pub build: String,
    pub pool: Option<String>,
    pub status: JobStatus,
    pub hosts: HostArgs,
    pub timeout_mins: u32,
    #[serde(default)]
    pub abort_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn from_request(id: JobId, request: &JobRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: request.name.clone(),
            suite: request.suite.clone(),
            board: request.board.clone(),
            build: request.build.clone(),
            pool: request.pool.clone(),
            status: JobStatus::Queued,
            hosts: request.hosts.clone(),
            timeout_mins: request.timeout_mins,
            abort_requested: false,
            created_at,
            completed_at: None,
        }
    }

    /// Point in time after which a running job counts as timed out.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at + Duration::minutes(i64::from(self.timeout_mins))
    }
}

/// Identity of a suite run used for dedup lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobQuery {
    pub suite: String,
    pub board: String,
    pub build: String,
    pub pool: Option<String>,
}

impl JobQuery {
    pub fn matches(&self, job: &JobRecord) -> bool {
        job.suite == self.suite
            && job.board == self.board
            && job.build == self.build
            && job.pool == self.pool
    }
}

/// Conventional job name for a suite run, e.g.
/// `link-release/R21-2000.0.0-test_suites/control.bvt`.
pub fn suite_job_name(build: &str, suite: &str) -> String {
    format!("{}-test_suites/control.{}", build, suite)
}
