//! Approval oracle - asynchronous rendezvous with a human reviewer
//!
//! At most one approval is outstanding per process. A new `ask` supersedes
//! any unresolved one (resolving it to reject), and a pipeline stop rejects
//! the pending approval so the worker is freed rather than left dangling.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Outbound side of the rendezvous: renders the approve/reject message to
/// the human. Implemented by the chat bridge.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn request_approval(&self, stage: &str, task: &str) -> Result<()>;
}

pub struct ApprovalOracle {
    notifier: Mutex<Option<Arc<dyn ApprovalNotifier>>>,
    pending: Mutex<Option<oneshot::Sender<bool>>>,
}

impl ApprovalOracle {
    pub fn new() -> Self {
        Self {
            notifier: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Install or clear the outbound channel. Called when the chat bridge is
    /// (re)initialised from settings.
    pub fn set_notifier(&self, notifier: Option<Arc<dyn ApprovalNotifier>>) {
        *self.notifier.lock() = notifier;
    }

    /// Ask the human to approve `task` in `stage`. Resolves immediately to
    /// `true` when no bridge is configured, and when the bridge cannot
    /// deliver the request (an unreachable reviewer must not hang the loop).
    pub async fn ask(&self, stage: &str, task: &str) -> bool {
        let Some(notifier) = self.notifier.lock().clone() else {
            return true;
        };

        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.pending.lock().replace(tx) {
            info!("Superseding an unresolved approval request");
            let _ = previous.send(false);
        }

        if let Err(e) = notifier.request_approval(stage, task).await {
            warn!(error = %e, "Could not deliver approval request; approving");
            self.pending.lock().take();
            return true;
        }

        rx.await.unwrap_or(false)
    }

    /// Resolve the outstanding approval, if any. Returns whether a waiter
    /// was resolved. Driven by the chat callback route.
    pub fn resolve(&self, approved: bool) -> bool {
        match self.pending.lock().take() {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    /// Reject any pending approval. Invoked when a pipeline stops.
    pub fn reject_pending(&self) {
        if self.resolve(false) {
            info!("Rejected pending approval on stop");
        }
    }
}

impl Default for ApprovalOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SilentNotifier;

    #[async_trait]
    impl ApprovalNotifier for SilentNotifier {
        async fn request_approval(&self, _stage: &str, _task: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unconfigured_oracle_approves_immediately() {
        let oracle = ApprovalOracle::new();
        assert!(oracle.ask("stage", "task").await);
    }

    #[tokio::test]
    async fn resolution_unblocks_the_waiter() {
        let oracle = Arc::new(ApprovalOracle::new());
        oracle.set_notifier(Some(Arc::new(SilentNotifier)));

        let waiter = {
            let oracle = oracle.clone();
            tokio::spawn(async move { oracle.ask("stage", "task").await })
        };

        // Let the ask register its pending channel before resolving.
        while !oracle.resolve(true) {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn a_new_ask_supersedes_the_pending_one() {
        let oracle = Arc::new(ApprovalOracle::new());
        oracle.set_notifier(Some(Arc::new(SilentNotifier)));

        let first = {
            let oracle = oracle.clone();
            tokio::spawn(async move { oracle.ask("stage", "first").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let second = {
            let oracle = oracle.clone();
            tokio::spawn(async move { oracle.ask("stage", "second").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // The first waiter was superseded and rejected.
        assert!(!first.await.unwrap());

        oracle.resolve(true);
        assert!(second.await.unwrap());
    }

    #[tokio::test]
    async fn stop_rejects_the_pending_approval() {
        let oracle = Arc::new(ApprovalOracle::new());
        oracle.set_notifier(Some(Arc::new(SilentNotifier)));

        let waiter = {
            let oracle = oracle.clone();
            tokio::spawn(async move { oracle.ask("stage", "task").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        oracle.reject_pending();
        assert!(!waiter.await.unwrap());
    }
}
