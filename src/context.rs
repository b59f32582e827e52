//! Cooperative cancellation shared across orchestrator tasks.
//!
//! Adapted from the thread/condvar `Ctx` of the on-host supervisor world to a
//! `tokio::sync::watch` token, since every task that observes cancellation
//! here is an async task rather than a blocking thread.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Context {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Derives a child context: cancelling the child never cancels the
    /// parent, but cancelling the parent is not observed by the child either
    /// (the orchestrator cancels children explicitly, per deployment).
    pub fn child(&self) -> Self {
        Self::new()
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn not_cancelled_by_default() {
        let ctx = Context::new();
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_observed() {
        let ctx = Context::new();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancellation should be observed promptly")
            .unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn child_is_independent() {
        let parent = Context::new();
        let child = parent.child();
        parent.cancel();
        assert!(parent.is_cancelled());
        assert!(!child.is_cancelled());
    }
}
