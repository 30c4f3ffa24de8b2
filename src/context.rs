use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Process-wide order mode, toggled by the health monitor and by operator
/// intervention. Ported from the Python `order_mode` context key (§9 design
/// note: "the CancelContext carries both cancellation and the mutable
/// `order_mode` key").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderMode {
    Normal,
    ReduceOnly,
    Pending,
    Maintain,
}

impl OrderMode {
    pub fn allows_new_dealer(&self, is_reduce_position: bool) -> bool {
        match self {
            OrderMode::Normal => true,
            OrderMode::ReduceOnly => is_reduce_position,
            OrderMode::Pending | OrderMode::Maintain => false,
        }
    }
}

/// Hierarchical, monotonic-once-canceled cancellation signal shared across
/// every worker, plus the mutable `order_mode` key. Grounded on
/// `cross_arbitrage/utils/context.py`'s `Context`/`CancelContext` classes: a
/// cancel flag that forward-chains to a parent, and a `sleep_with_context`
/// helper that polls it instead of sleeping blindly.
#[derive(Clone)]
pub struct CancelContext {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelContext>>,
    order_mode: watch::Sender<OrderMode>,
}

impl CancelContext {
    pub fn new(initial_mode: OrderMode) -> Self {
        let (tx, _rx) = watch::channel(initial_mode);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: None,
            order_mode: tx,
        }
    }

    /// A child context cancels independently but also observes the parent's
    /// cancellation and shares its `order_mode` channel.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
            order_mode: self.order_mode.clone(),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.parent {
            Some(p) => p.is_canceled(),
            None => false,
        }
    }

    pub fn order_mode(&self) -> OrderMode {
        *self.order_mode.borrow()
    }

    pub fn set_order_mode(&self, mode: OrderMode) {
        let _ = self.order_mode.send(mode);
    }

    pub fn watch_order_mode(&self) -> watch::Receiver<OrderMode> {
        self.order_mode.subscribe()
    }

    /// Cancel-aware sleep: polls `is_canceled()` at `interval` instead of a
    /// single blocking sleep, so long waits (CLEAR's 10s grace, the
    /// end-of-dealer 10s settle) exit promptly on shutdown.
    pub async fn sleep(&self, total: Duration, interval: Duration) {
        let mut waited = Duration::ZERO;
        while waited < total {
            if self.is_canceled() {
                return;
            }
            let step = interval.min(total - waited);
            tokio::time::sleep(step).await;
            waited += step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_observes_parent_cancellation() {
        let parent = CancelContext::new(OrderMode::Normal);
        let child = parent.child();
        assert!(!child.is_canceled());
        parent.cancel();
        assert!(child.is_canceled());
    }

    #[test]
    fn order_mode_gating() {
        assert!(OrderMode::Normal.allows_new_dealer(false));
        assert!(OrderMode::ReduceOnly.allows_new_dealer(true));
        assert!(!OrderMode::ReduceOnly.allows_new_dealer(false));
        assert!(!OrderMode::Pending.allows_new_dealer(true));
        assert!(!OrderMode::Maintain.allows_new_dealer(true));
    }

    #[tokio::test]
    async fn sleep_returns_early_on_cancel() {
        let ctx = CancelContext::new(OrderMode::Normal);
        let ctx2 = ctx.clone();
        let handle = tokio::spawn(async move {
            ctx2.sleep(Duration::from_secs(10), Duration::from_millis(10)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("sleep did not return promptly after cancel")
            .unwrap();
    }
}
