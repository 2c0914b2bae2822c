use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Async cleanup run when the process is asked to terminate.
pub type ShutdownHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Process-wide shutdown: a cancellation token plus a stack of release hooks.
///
/// Hooks run newest first, so a scoped resource releases before whatever was
/// installed before it, and the token is cancelled last.
#[derive(Clone, Default)]
pub struct ShutdownHandler {
    token: CancellationToken,
    hooks: Arc<Mutex<Vec<(u64, ShutdownHook)>>>,
    next_id: Arc<AtomicU64>,
}

impl ShutdownHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn register_hook(&self, hook: ShutdownHook) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock_hooks().push((id, hook));
        id
    }

    /// Returns false if the hook already ran or was never registered.
    pub fn remove_hook(&self, id: u64) -> bool {
        let mut hooks = self.lock_hooks();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    pub fn hook_count(&self) -> usize {
        self.lock_hooks().len()
    }

    /// Run every registered hook, newest first, then cancel the token.
    pub async fn trigger(&self) {
        let hooks: Vec<(u64, ShutdownHook)> = {
            let mut guard = self.lock_hooks();
            guard.drain(..).rev().collect()
        };
        for (id, hook) in hooks {
            tracing::debug!(hook_id = id, "Running shutdown hook");
            hook().await;
        }
        self.token.cancel();
    }

    fn lock_hooks(&self) -> std::sync::MutexGuard<'_, Vec<(u64, ShutdownHook)>> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// On either signal the registered hooks run and the handler's token is
/// cancelled. Loops monitor the token and exit between ticks.
pub fn install_shutdown_handler() -> ShutdownHandler {
    let handler = ShutdownHandler::new();
    let handler_clone = handler.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        handler_clone.trigger().await;
    });

    handler
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn recording_hook(log: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> ShutdownHook {
        Arc::new(move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn hooks_run_newest_first_then_token_cancels() {
        let handler = ShutdownHandler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        handler.register_hook(recording_hook(log.clone(), "first"));
        handler.register_hook(recording_hook(log.clone(), "second"));

        handler.trigger().await;
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
        assert!(handler.token().is_cancelled());
        assert_eq!(handler.hook_count(), 0);
    }

    #[tokio::test]
    async fn removed_hooks_do_not_run() {
        let handler = ShutdownHandler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = handler.register_hook(recording_hook(log.clone(), "gone"));
        assert!(handler.remove_hook(id));
        assert!(!handler.remove_hook(id));

        handler.trigger().await;
        assert!(log.lock().unwrap().is_empty());
    }
}
