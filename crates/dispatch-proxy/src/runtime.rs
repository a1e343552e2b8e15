//! Shared runtime handle.
//!
//! Bundles the balancer, the DNS resolver and the loop-liveness counter so
//! tests can run fully isolated instances side by side. Long-lived work
//! (listeners, sessions, test actors) takes a hold; `idle()` completes
//! exactly when every hold has been released.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Notify;

use dispatch_balancer::Balancer;
use dispatch_net::Resolver;

struct RuntimeInner {
    balancer: Balancer,
    resolver: Resolver,
    holds: AtomicUsize,
    idle: Notify,
    next_sid: AtomicU64,
}

/// Process-wide services, passed explicitly instead of living in globals.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(balancer: Balancer) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                balancer,
                resolver: Resolver::new(),
                holds: AtomicUsize::new(0),
                idle: Notify::new(),
                next_sid: AtomicU64::new(0),
            }),
        }
    }

    pub fn balancer(&self) -> &Balancer {
        &self.inner.balancer
    }

    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    /// Allocates the next session id. Ids are monotonically increasing
    /// starting at 1.
    pub fn next_sid(&self) -> u64 {
        self.inner.next_sid.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Keeps the runtime alive until the returned guard is dropped.
    pub fn hold(&self) -> HoldGuard {
        self.inner.holds.fetch_add(1, Ordering::Relaxed);
        HoldGuard {
            inner: self.inner.clone(),
        }
    }

    /// Completes once every hold has been released.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.holds.load(Ordering::Relaxed) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps the runtime loop alive while held.
pub struct HoldGuard {
    inner: Arc<RuntimeInner>,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        if self.inner.holds.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_without_holds() {
        let runtime = Runtime::new(Balancer::new());
        runtime.idle().await;
    }

    #[tokio::test]
    async fn test_idle_waits_for_holds() {
        let runtime = Runtime::new(Balancer::new());
        let hold = runtime.hold();

        let waiter = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.idle().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(hold);
        waiter.await.unwrap();
    }

    #[test]
    fn test_sids_are_monotonic() {
        let runtime = Runtime::new(Balancer::new());
        assert_eq!(runtime.next_sid(), 1);
        assert_eq!(runtime.next_sid(), 2);
        assert_eq!(runtime.next_sid(), 3);
    }
}
