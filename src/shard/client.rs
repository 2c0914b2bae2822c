use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ShardConfig;
use crate::error::Result;
use crate::inventory::{InventoryService, JobId};
use crate::shard::state::ShardState;

/// Keeps a shard's [`ShardState`] in sync with the master through periodic
/// heartbeats.
pub struct ShardClient {
    inventory: Arc<dyn InventoryService>,
    config: ShardConfig,
    state: Arc<RwLock<ShardState>>,
    shutdown: CancellationToken,
}

impl ShardClient {
    /// Fails with a configuration error unless `config` describes a shard.
    pub fn new(
        inventory: Arc<dyn InventoryService>,
        config: ShardConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.shard_hostname()?;
        Ok(Self {
            inventory,
            config,
            state: Arc::new(RwLock::new(ShardState::new())),
            shutdown,
        })
    }

    pub fn state(&self) -> Arc<RwLock<ShardState>> {
        self.state.clone()
    }

    /// One heartbeat: upload finished jobs, then upsert whatever the master
    /// sends back.
    pub async fn do_heartbeat(&self) -> Result<()> {
        let shard_hostname = self.config.shard_hostname()?;
        let request = self.state.read().await.heartbeat_request(shard_hostname);
        let uploaded: Vec<JobId> = request.finished_jobs.iter().map(|j| j.id).collect();

        let response = self.inventory.shard_heartbeat(&request).await?;

        let mut state = self.state.write().await;
        state.mark_uploaded(&uploaded);
        state.apply(&response);
        tracing::info!(
            shard = shard_hostname,
            hosts = response.hosts.len(),
            jobs = response.jobs.len(),
            uploaded = uploaded.len(),
            "Heartbeat complete"
        );
        Ok(())
    }

    /// Heartbeat every interval until [`ShardClient::shutdown`] is called.
    ///
    /// Transient failures are logged and retried on the next tick. Fatal
    /// ones end the loop with the error.
    pub async fn run(&self) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.config.heartbeat_interval_ms,
            "Shard client started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.do_heartbeat().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Shard client stopping");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Heartbeat failed");
                }
            }
        }

        tracing::info!("Shard client stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
