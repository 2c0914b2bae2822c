use std::sync::Arc;

use crate::error::{LabError, Result};
use crate::hosts::{HostSpec, MetaHostGroup};
use crate::inventory::{suite_job_name, Host, HostFilter, InventoryService, JobQuery, JobRequest};

/// One suite run to schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteRequest {
    pub suite: String,
    pub board: String,
    pub build: String,
    pub pool: Option<String>,
    /// Machines to spread the suite across; `None` means one.
    pub num: Option<u32>,
}

impl SuiteRequest {
    fn query(&self) -> JobQuery {
        JobQuery {
            suite: self.suite.clone(),
            board: self.board.clone(),
            build: self.build.clone(),
            pool: self.pool.clone(),
        }
    }

    fn host_spec(&self) -> HostSpec {
        let mut labels = vec![format!("board:{}", self.board)];
        if let Some(pool) = &self.pool {
            labels.push(format!("pool:{}", pool));
        }
        HostSpec::new(labels)
    }
}

/// Creates suite jobs, skipping any that the inventory already has.
pub struct DedupingScheduler {
    inventory: Arc<dyn InventoryService>,
    job_timeout_mins: u32,
}

impl DedupingScheduler {
    pub fn new(inventory: Arc<dyn InventoryService>, job_timeout_mins: u32) -> Self {
        Self {
            inventory,
            job_timeout_mins,
        }
    }

    /// Returns `Ok(false)` when an equivalent job exists and `force` is unset.
    pub async fn schedule_suite(&self, request: &SuiteRequest, force: bool) -> Result<bool> {
        if !force {
            let existing = self
                .inventory
                .find_jobs(&request.query())
                .await
                .map_err(|e| LabError::Dedup(e.to_string()))?;
            if let Some(job) = existing.first() {
                tracing::info!(
                    suite = %request.suite,
                    board = %request.board,
                    build = %request.build,
                    job_id = job.id,
                    "Suite already scheduled"
                );
                return Ok(false);
            }
        }

        let num = request.num.unwrap_or(1) as usize;
        let group = MetaHostGroup::new(request.host_spec(), num);
        let job = JobRequest {
            name: suite_job_name(&request.build, &request.suite),
            suite: request.suite.clone(),
            board: request.board.clone(),
            build: request.build.clone(),
            pool: request.pool.clone(),
            hosts: group.as_args(),
            timeout_mins: self.job_timeout_mins,
        };
        let job_id = self
            .inventory
            .create_job(&job)
            .await
            .map_err(|e| LabError::Schedule(e.to_string()))?;

        tracing::info!(
            job_id,
            suite = %request.suite,
            board = %request.board,
            build = %request.build,
            num,
            "Scheduled suite"
        );
        Ok(true)
    }

    /// Hosts carrying every label in `labels`.
    pub async fn get_hosts(&self, labels: &[String]) -> Result<Vec<Host>> {
        self.inventory
            .get_hosts(&HostFilter::labels(labels.iter().cloned()))
            .await
    }
}
