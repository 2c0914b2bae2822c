
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use lab_scheduler::hosts::{HostLockManager, HostsLockedBy};
use lab_scheduler::inventory::MemoryInventory;
use lab_scheduler::shutdown::ShutdownHandler;
use test_harness::{assert_eventually, lab_inventory};

async fn owner_of(inventory: &MemoryInventory, hostname: &str) -> Option<String> {
    inventory
        .host(hostname)
        .await
        .and_then(|h| h.lock.owner().map(str::to_string))
}

#[tokio::test]
async fn test_bulk_lock_and_unlock() {
    let inventory = lab_inventory().await;
    let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
    manager.add(["link-1", "link-2"]);
    manager.add(["link-2"]);
    assert_eq!(manager.hosts().len(), 2);

    manager.lock().await.unwrap();
    assert!(manager.is_locked());
    assert_eq!(owner_of(&inventory, "link-1").await.as_deref(), Some("me@lab"));
    assert_eq!(owner_of(&inventory, "link-2").await.as_deref(), Some("me@lab"));
    assert_eq!(owner_of(&inventory, "link-3").await, None);

    manager.unlock().await.unwrap();
    assert!(!manager.is_locked());
    assert_eq!(owner_of(&inventory, "link-1").await, None);
}

#[tokio::test]
async fn test_lock_one_host_refuses_foreign_lock() {
    let inventory = lab_inventory().await;
    inventory.lock_host_as("link-1", "other@lab").await;

    let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
    assert!(!manager.lock_one_host("link-1").await.unwrap());
    assert!(manager.hosts().is_empty());
    assert_eq!(owner_of(&inventory, "link-1").await.as_deref(), Some("other@lab"));

    assert!(manager.lock_one_host("link-2").await.unwrap());
    assert!(manager.hosts().contains("link-2"));
    assert_eq!(owner_of(&inventory, "link-2").await.as_deref(), Some("me@lab"));

    // Re-locking a host we already own is fine.
    assert!(manager.lock_one_host("link-2").await.unwrap());
    manager.unlock().await.unwrap();
}

#[tokio::test]
async fn test_lock_one_host_unknown_host() {
    let inventory = lab_inventory().await;
    let mut manager = HostLockManager::new(inventory, "me@lab");
    assert!(!manager.lock_one_host("missing-1").await.unwrap());
    assert!(!manager.is_locked());
}

#[tokio::test]
async fn test_rpc_failure_propagates_without_retry() {
    let inventory = lab_inventory().await;
    let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
    manager.add(["link-1"]);

    inventory.fail_next_calls(1);
    let before = inventory.call_count();
    let err = manager.lock().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(inventory.call_count(), before + 1);
    assert!(!manager.is_locked());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_manager_unlocks_before_returning() {
    let inventory = lab_inventory().await;
    {
        let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
        manager.add(["link-3"]);
        manager.lock().await.unwrap();
    }
    assert_eq!(owner_of(&inventory, "link-3").await, None);
}

#[test]
fn test_drop_then_runtime_shutdown_leaves_hosts_unlocked() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let inventory = rt.block_on(async {
        let inventory = lab_inventory().await;
        let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
        manager.add(["link-1"]);
        manager.lock().await.unwrap();
        drop(manager);
        inventory
    });
    drop(rt);

    let check = tokio::runtime::Builder::new_current_thread().build().unwrap();
    assert_eq!(check.block_on(owner_of(&inventory, "link-1")), None);
}

#[test]
fn test_drop_outside_runtime_unlocks() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (inventory, manager) = rt.block_on(async {
        let inventory = lab_inventory().await;
        let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
        manager.add(["link-2"]);
        manager.lock().await.unwrap();
        (inventory, manager)
    });
    drop(rt);
    drop(manager);

    let check = tokio::runtime::Builder::new_current_thread().build().unwrap();
    assert_eq!(check.block_on(owner_of(&inventory, "link-2")), None);
}

#[tokio::test]
async fn test_unlock_skips_hosts_never_locked_here() {
    let inventory = lab_inventory().await;
    inventory.lock_host_as("link-1", "other@lab").await;

    let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
    manager.add(["link-1"]);
    assert!(manager.lock_one_host("link-2").await.unwrap());
    assert_eq!(manager.locked_hosts().len(), 1);

    manager.unlock().await.unwrap();
    assert_eq!(owner_of(&inventory, "link-1").await.as_deref(), Some("other@lab"));
    assert_eq!(owner_of(&inventory, "link-2").await, None);
}

#[tokio::test]
async fn test_dropped_manager_unlocks_on_current_thread_runtime() {
    let inventory = lab_inventory().await;
    {
        let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
        manager.add(["link-3"]);
        manager.lock().await.unwrap();
    }

    let inv = inventory.clone();
    assert_eventually(
        || {
            let inv = inv.clone();
            async move { owner_of(&inv, "link-3").await.is_none() }
        },
        Duration::from_secs(2),
        "host should be unlocked after the manager is dropped",
    )
    .await;
}

#[tokio::test]
async fn test_guard_unlocks_on_shutdown() {
    let inventory = lab_inventory().await;
    let shutdown = ShutdownHandler::new();
    let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
    manager.add(["link-1", "link-2"]);
    let manager = Arc::new(Mutex::new(manager));

    let _guard = HostsLockedBy::lock(manager.clone(), &shutdown).await.unwrap();
    assert_eq!(shutdown.hook_count(), 1);
    assert_eq!(owner_of(&inventory, "link-1").await.as_deref(), Some("me@lab"));

    shutdown.trigger().await;
    assert_eq!(owner_of(&inventory, "link-1").await, None);
    assert_eq!(owner_of(&inventory, "link-2").await, None);
    assert!(shutdown.token().is_cancelled());
    assert!(!manager.lock().await.is_locked());
}

#[tokio::test]
async fn test_guard_release_removes_hook() {
    let inventory = lab_inventory().await;
    let shutdown = ShutdownHandler::new();
    let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
    manager.add(["link-1"]);
    let manager = Arc::new(Mutex::new(manager));

    let guard = HostsLockedBy::lock(manager.clone(), &shutdown).await.unwrap();
    guard.release().await.unwrap();

    assert_eq!(shutdown.hook_count(), 0);
    assert_eq!(owner_of(&inventory, "link-1").await, None);
    assert!(!shutdown.token().is_cancelled());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_guard_drop_unlocks_before_returning() {
    let inventory = lab_inventory().await;
    let shutdown = ShutdownHandler::new();
    let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
    manager.add(["link-1"]);
    let manager = Arc::new(Mutex::new(manager));

    {
        let _guard = HostsLockedBy::lock(manager.clone(), &shutdown).await.unwrap();
    }
    assert_eq!(shutdown.hook_count(), 0);
    assert_eq!(owner_of(&inventory, "link-1").await, None);
    assert!(!manager.lock().await.is_locked());
}

#[tokio::test]
async fn test_guard_drop_unlocks() {
    let inventory = lab_inventory().await;
    let shutdown = ShutdownHandler::new();
    let mut manager = HostLockManager::new(inventory.clone(), "me@lab");
    manager.add(["link-2"]);
    let manager = Arc::new(Mutex::new(manager));

    {
        let _guard = HostsLockedBy::lock(manager.clone(), &shutdown).await.unwrap();
    }
    assert_eq!(shutdown.hook_count(), 0);

    let inv = inventory.clone();
    assert_eventually(
        || {
            let inv = inv.clone();
            async move { owner_of(&inv, "link-2").await.is_none() }
        },
        Duration::from_secs(2),
        "host should be unlocked after the guard is dropped",
    )
    .await;
}
