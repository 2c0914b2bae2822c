use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{
    HeartbeatRequest, HeartbeatResponse, Host, HostFilter, HostId, HostUpdate, InventoryService,
    JobId, JobQuery, JobRecord, JobRequest, JobStatus, LockState,
};
use crate::error::{LabError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    hosts: BTreeMap<HostId, Host>,
    jobs: BTreeMap<JobId, JobRecord>,
    /// shard hostname -> labels whose hosts and jobs belong to that shard
    shards: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    hosts: Vec<FixtureHost>,
    #[serde(default)]
    shards: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct FixtureHost {
    hostname: String,
    #[serde(default)]
    labels: Vec<String>,
}

/// In-process inventory. Serves tests and local dry runs of the binary.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    state: RwLock<MemoryState>,
    next_host_id: AtomicU64,
    next_job_id: AtomicU64,
    /// Number of upcoming calls that fail with a transient RPC error.
    failures_pending: AtomicU32,
    calls: AtomicU64,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load hosts and shard assignments from a JSON fixture:
    ///
    /// ```json
    /// {"hosts": [{"hostname": "h1", "labels": ["board:link"]}],
    ///  "shards": {"shard1.lab": ["board:link"]}}
    /// ```
    pub async fn from_fixture(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LabError::filesystem(path, e))?;
        let fixture: Fixture = serde_json::from_str(&raw)
            .map_err(|e| LabError::Config(format!("{}: {}", path.display(), e)))?;

        let inventory = Self::new();
        for host in fixture.hosts {
            inventory.add_host(&host.hostname, host.labels).await;
        }
        for (shard, labels) in fixture.shards {
            inventory.assign_shard(&shard, labels).await;
        }
        Ok(inventory)
    }

    pub async fn add_host<I, S>(&self, hostname: &str, labels: I) -> HostId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.next_host_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .write()
            .await
            .hosts
            .insert(id, Host::new(id, hostname, labels));
        id
    }

    pub async fn host(&self, hostname: &str) -> Option<Host> {
        self.state
            .read()
            .await
            .hosts
            .values()
            .find(|h| h.hostname == hostname)
            .cloned()
    }

    /// Lock a host on behalf of some other process.
    pub async fn lock_host_as(&self, hostname: &str, owner: &str) -> bool {
        let mut state = self.state.write().await;
        match state.hosts.values_mut().find(|h| h.hostname == hostname) {
            Some(host) => {
                host.lock = LockState::Locked {
                    owner: owner.to_string(),
                    locked_at: Utc::now(),
                };
                true
            }
            None => false,
        }
    }

    pub async fn assign_shard<I, S>(&self, shard_hostname: &str, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .write()
            .await
            .shards
            .entry(shard_hostname.to_string())
            .or_default()
            .extend(labels.into_iter().map(Into::into));
    }

    pub async fn jobs(&self) -> Vec<JobRecord> {
        self.state.read().await.jobs.values().cloned().collect()
    }

    pub async fn job(&self, id: JobId) -> Option<JobRecord> {
        self.state.read().await.jobs.get(&id).cloned()
    }

    pub async fn set_job_status(&self, id: JobId, status: JobStatus) -> bool {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) => {
                job.status = status;
                if status.is_finished() {
                    job.completed_at = Some(Utc::now());
                }
                true
            }
            None => false,
        }
    }

    pub async fn request_abort(&self, id: JobId) -> bool {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&id) {
            Some(job) => {
                job.abort_requested = true;
                true
            }
            None => false,
        }
    }

    /// Make the next `count` calls fail with a transient RPC error.
    pub fn fail_next_calls(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Total number of service calls received, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self, op: &'static str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LabError::rpc(op, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryService for MemoryInventory {
    async fn get_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>> {
        self.enter("get_hosts")?;
        Ok(self
            .state
            .read()
            .await
            .hosts
            .values()
            .filter(|h| filter.matches(h))
            .cloned()
            .collect())
    }

    async fn modify_hosts(&self, filter: &HostFilter, update: &HostUpdate) -> Result<usize> {
        self.enter("modify_hosts")?;
        let mut state = self.state.write().await;
        let mut touched = 0;
        for host in state.hosts.values_mut().filter(|h| filter.matches(h)) {
            host.lock = match update {
                HostUpdate::Lock { owner } => LockState::Locked {
                    owner: owner.clone(),
                    locked_at: Utc::now(),
                },
                HostUpdate::Unlock => LockState::Unlocked,
            };
            touched += 1;
        }
        Ok(touched)
    }

    async fn shard_heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.enter("shard_heartbeat")?;
        let mut state = self.state.write().await;
        let labels = state
            .shards
            .get(&request.shard_hostname)
            .cloned()
            .ok_or_else(|| {
                LabError::rpc(
                    "shard_heartbeat",
                    format!("unknown shard {}", request.shard_hostname),
                )
            })?;

        for finished in &request.finished_jobs {
            if let Some(job) = state.jobs.get_mut(&finished.id) {
                job.status = finished.status;
                job.completed_at = finished.completed_at;
            }
        }

        let hosts = state
            .hosts
            .values()
            .filter(|h| !request.known_host_ids.contains(&h.id))
            .filter(|h| h.labels.iter().any(|l| labels.contains(l)))
            .cloned()
            .collect();
        let jobs = state
            .jobs
            .values()
            .filter(|j| !request.known_job_ids.contains(&j.id))
            .filter(|j| !j.status.is_finished())
            .filter(|j| labels.contains(&format!("board:{}", j.board)))
            .cloned()
            .collect();

        Ok(HeartbeatResponse { hosts, jobs })
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>> {
        self.enter("find_jobs")?;
        Ok(self
            .state
            .read()
            .await
            .jobs
            .values()
            .filter(|j| query.matches(j))
            .cloned()
            .collect())
    }

    async fn create_job(&self, request: &JobRequest) -> Result<JobId> {
        self.enter("create_job")?;
        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = JobRecord::from_request(id, request, Utc::now());
        self.state.write().await.jobs.insert(id, job);
        tracing::debug!(job_id = id, name = %request.name, "Job created");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::HostArgs;

    fn request(board: &str) -> JobRequest {
        JobRequest {
            name: "job".to_string(),
            suite: "bvt".to_string(),
            board: board.to_string(),
            build: "R20-1.0".to_string(),
            pool: None,
            hosts: HostArgs::Explicit { hosts: vec![] },
            timeout_mins: 60,
        }
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let inventory = MemoryInventory::new();
        inventory.fail_next_calls(2);
        assert!(inventory.get_hosts(&HostFilter::default()).await.is_err());
        assert!(inventory.get_hosts(&HostFilter::default()).await.is_err());
        assert!(inventory.get_hosts(&HostFilter::default()).await.is_ok());
        assert_eq!(inventory.call_count(), 3);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_shard_fails() {
        let inventory = MemoryInventory::new();
        let err = inventory
            .shard_heartbeat(&HeartbeatRequest {
                shard_hostname: "nope".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn heartbeat_returns_only_unknown_records_for_shard_labels() {
        let inventory = MemoryInventory::new();
        let h1 = inventory.add_host("h1", ["board:link"]).await;
        inventory.add_host("h2", ["board:lumpy"]).await;
        inventory.assign_shard("shard1", ["board:link"]).await;
        let link_job = inventory.create_job(&request("link")).await.unwrap();
        inventory.create_job(&request("lumpy")).await.unwrap();

        let first = inventory
            .shard_heartbeat(&HeartbeatRequest {
                shard_hostname: "shard1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.hosts.len(), 1);
        assert_eq!(first.hosts[0].id, h1);
        assert_eq!(first.jobs.len(), 1);
        assert_eq!(first.jobs[0].id, link_job);

        let second = inventory
            .shard_heartbeat(&HeartbeatRequest {
                shard_hostname: "shard1".to_string(),
                known_host_ids: vec![h1],
                known_job_ids: vec![link_job],
                finished_jobs: vec![],
            })
            .await
            .unwrap();
        assert!(second.hosts.is_empty());
        assert!(second.jobs.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_persists_finished_jobs() {
        let inventory = MemoryInventory::new();
        inventory.assign_shard("shard1", ["board:link"]).await;
        let id = inventory.create_job(&request("link")).await.unwrap();
        let mut finished = inventory.job(id).await.unwrap();
        finished.status = JobStatus::Completed;
        finished.completed_at = Some(Utc::now());

        inventory
            .shard_heartbeat(&HeartbeatRequest {
                shard_hostname: "shard1".to_string(),
                finished_jobs: vec![finished],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(inventory.job(id).await.unwrap().status, JobStatus::Completed);
    }
}
