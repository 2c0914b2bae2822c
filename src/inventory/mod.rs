//! The inventory/scheduling service the rest of the crate talks to.
//!
//! Host and job records live in an external service. Every component takes
//! an `Arc<dyn InventoryService>` at construction instead of reaching for a
//! process-wide client, so tests can hand in a [`MemoryInventory`] and
//! production code a [`RetryingInventory`] around a real transport.
//!
//! - [`host`]: host records, lock state, filters and updates
//! - [`job`]: job records, creation requests and dedup queries
//! - [`memory`]: in-process implementation
//! - [`retry`]: timeout/retry decorator

pub mod host;
pub mod job;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use host::{Host, HostFilter, HostId, HostUpdate, LockState};
pub use job::{suite_job_name, HostArgs, JobId, JobQuery, JobRecord, JobRequest, JobStatus};
pub use memory::MemoryInventory;
pub use retry::RetryingInventory;

/// Payload a shard sends with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub shard_hostname: String,
    /// Records the master already sent; it only returns what is missing.
    pub known_host_ids: Vec<HostId>,
    pub known_job_ids: Vec<JobId>,
    /// Jobs that finished on the shard since the last successful heartbeat.
    pub finished_jobs: Vec<JobRecord>,
}

/// Host and job deltas returned by the master.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub hosts: Vec<Host>,
    pub jobs: Vec<JobRecord>,
}

#[async_trait]
pub trait InventoryService: Send + Sync {
    async fn get_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>>;

    /// Applies `update` to every host matching `filter`, returning how many
    /// hosts were touched.
    async fn modify_hosts(&self, filter: &HostFilter, update: &HostUpdate) -> Result<usize>;

    async fn shard_heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse>;

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>>;

    async fn create_job(&self, request: &JobRequest) -> Result<JobId>;
}
