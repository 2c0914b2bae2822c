use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    HeartbeatRequest, HeartbeatResponse, Host, HostFilter, HostUpdate, InventoryService, JobId,
    JobQuery, JobRecord, JobRequest,
};
use crate::config::RpcConfig;
use crate::error::{LabError, Result};

/// Wraps an inventory client with a per-call timeout and bounded retries.
///
/// Only transient errors (RPC failures and timeouts) are retried. Anything
/// else, and the last transient error once retries run out, is returned to
/// the caller unchanged.
pub struct RetryingInventory {
    inner: Arc<dyn InventoryService>,
    policy: RpcConfig,
}

impl RetryingInventory {
    pub fn new(inner: Arc<dyn InventoryService>, policy: RpcConfig) -> Self {
        Self { inner, policy }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let timeout = self.policy.timeout();
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(LabError::RpcTimeout { op, timeout }),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = self.policy.retry_delay(attempt);
                    tracing::warn!(
                        op,
                        attempt,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Inventory call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl InventoryService for RetryingInventory {
    async fn get_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>> {
        self.call("get_hosts", || self.inner.get_hosts(filter)).await
    }

    async fn modify_hosts(&self, filter: &HostFilter, update: &HostUpdate) -> Result<usize> {
        self.call("modify_hosts", || self.inner.modify_hosts(filter, update))
            .await
    }

    async fn shard_heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.call("shard_heartbeat", || self.inner.shard_heartbeat(request))
            .await
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>> {
        self.call("find_jobs", || self.inner.find_jobs(query)).await
    }

    async fn create_job(&self, request: &JobRequest) -> Result<JobId> {
        self.call("create_job", || self.inner.create_job(request)).await
    }
}
