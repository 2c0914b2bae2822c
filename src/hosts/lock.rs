use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::inventory::{HostFilter, HostUpdate, InventoryService, LockState};
use crate::shutdown::{ShutdownHandler, ShutdownHook};

/// Locks and unlocks a set of hosts in the inventory on behalf of one owner.
///
/// Locks are cooperative flags in the inventory. [`HostLockManager::lock`]
/// sets them in bulk without checking who holds them;
/// [`HostLockManager::lock_one_host`] refuses hosts someone else holds.
/// Only hosts this manager actually locked are unlocked again.
pub struct HostLockManager {
    inventory: Arc<dyn InventoryService>,
    owner: String,
    hosts: BTreeSet<String>,
    locked: BTreeSet<String>,
}

impl HostLockManager {
    pub fn new(inventory: Arc<dyn InventoryService>, owner: impl Into<String>) -> Self {
        Self {
            inventory,
            owner: owner.into(),
            hosts: BTreeSet::new(),
            locked: BTreeSet::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn hosts(&self) -> &BTreeSet<String> {
        &self.hosts
    }

    pub fn is_locked(&self) -> bool {
        !self.locked.is_empty()
    }

    /// Hosts currently locked by this manager.
    pub fn locked_hosts(&self) -> &BTreeSet<String> {
        &self.locked
    }

    pub fn add<I, S>(&mut self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts.extend(hosts.into_iter().map(Into::into));
    }

    pub async fn lock(&mut self) -> Result<()> {
        if self.hosts.is_empty() {
            return Ok(());
        }
        let filter = HostFilter::hostnames(self.hosts.iter().cloned());
        let update = HostUpdate::Lock {
            owner: self.owner.clone(),
        };
        let touched = self.inventory.modify_hosts(&filter, &update).await?;
        self.locked.extend(self.hosts.iter().cloned());
        tracing::info!(owner = %self.owner, hosts = touched, "Locked hosts");
        Ok(())
    }

    pub async fn unlock(&mut self) -> Result<()> {
        if self.locked.is_empty() {
            return Ok(());
        }
        let filter = HostFilter::hostnames(self.locked.iter().cloned());
        let touched = self
            .inventory
            .modify_hosts(&filter, &HostUpdate::Unlock)
            .await?;
        self.locked.clear();
        tracing::info!(owner = %self.owner, hosts = touched, "Unlocked hosts");
        Ok(())
    }

    /// Lock `hostname` unless another owner already holds it.
    ///
    /// Returns false on contention or when the inventory does not know the
    /// host. The host joins the managed set only when the lock is taken.
    pub async fn lock_one_host(&mut self, hostname: &str) -> Result<bool> {
        let hosts = self
            .inventory
            .get_hosts(&HostFilter::hostnames([hostname]))
            .await?;
        let Some(host) = hosts.into_iter().next() else {
            tracing::warn!(hostname, "Cannot lock unknown host");
            return Ok(false);
        };

        if let LockState::Locked { owner, locked_at } = &host.lock {
            if owner != &self.owner {
                tracing::warn!(
                    hostname,
                    locked_by = %owner,
                    locked_at = %locked_at,
                    "Host is already locked"
                );
                return Ok(false);
            }
        }

        let update = HostUpdate::Lock {
            owner: self.owner.clone(),
        };
        self.inventory
            .modify_hosts(&HostFilter::hostnames([hostname]), &update)
            .await?;
        self.hosts.insert(hostname.to_string());
        self.locked.insert(hostname.to_string());
        tracing::info!(hostname, owner = %self.owner, "Locked host");
        Ok(true)
    }
}

impl Drop for HostLockManager {
    fn drop(&mut self) {
        if self.locked.is_empty() {
            return;
        }
        let hosts: Vec<String> = std::mem::take(&mut self.locked).into_iter().collect();
        let inventory = self.inventory.clone();
        finish_on_drop(async move {
            let filter = HostFilter::hostnames(hosts.iter().cloned());
            match inventory.modify_hosts(&filter, &HostUpdate::Unlock).await {
                Ok(touched) => tracing::info!(hosts = touched, "Unlocked hosts on drop"),
                Err(e) => tracing::error!(?hosts, error = %e, "Failed to unlock hosts on drop"),
            }
        });
    }
}

/// Run an unlock from a destructor and wait for it when the runtime allows.
///
/// A multi-thread runtime blocks this worker in place. Outside any runtime a
/// throwaway current-thread runtime drives it. A current-thread runtime cannot
/// be blocked, so the unlock is only spawned there.
fn finish_on_drop<F>(unlock: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(unlock));
        }
        Ok(handle) => {
            tracing::warn!(
                "Hosts dropped while locked on a current-thread runtime; unlocking in the \
                 background. Call HostsLockedBy::release to wait for the unlock"
            );
            handle.spawn(unlock);
        }
        Err(_) => match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt.block_on(unlock),
            Err(e) => {
                tracing::error!(error = %e, "No runtime to unlock dropped hosts; they stay locked")
            }
        },
    }
}

/// Keeps a manager's hosts locked for a scope.
///
/// Construction locks the hosts and registers a shutdown hook that unlocks
/// them, so a signal arriving mid-scope still releases them before the
/// handlers installed earlier run. [`HostsLockedBy::release`] removes the
/// hook and unlocks.
pub struct HostsLockedBy {
    manager: Arc<Mutex<HostLockManager>>,
    shutdown: ShutdownHandler,
    hook_id: Option<u64>,
}

impl HostsLockedBy {
    pub async fn lock(manager: Arc<Mutex<HostLockManager>>, shutdown: &ShutdownHandler) -> Result<Self> {
        manager.lock().await.lock().await?;

        let hook_manager = manager.clone();
        let hook: ShutdownHook = Arc::new(move || {
            let manager = hook_manager.clone();
            async move {
                if let Err(e) = manager.lock().await.unlock().await {
                    tracing::error!(error = %e, "Failed to unlock hosts during shutdown");
                }
            }
            .boxed()
        });
        let hook_id = shutdown.register_hook(hook);

        Ok(Self {
            manager,
            shutdown: shutdown.clone(),
            hook_id: Some(hook_id),
        })
    }

    pub fn manager(&self) -> &Arc<Mutex<HostLockManager>> {
        &self.manager
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(id) = self.hook_id.take() {
            self.shutdown.remove_hook(id);
        }
        self.manager.lock().await.unlock().await
    }
}

impl Drop for HostsLockedBy {
    fn drop(&mut self) {
        let Some(id) = self.hook_id.take() else {
            return;
        };
        if !self.shutdown.remove_hook(id) {
            // Shutdown already ran the hook.
            return;
        }
        let manager = self.manager.clone();
        finish_on_drop(async move {
            if let Err(e) = manager.lock().await.unlock().await {
                tracing::error!(error = %e, "Failed to unlock hosts on scope exit");
            }
        });
    }
}
