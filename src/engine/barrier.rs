use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Counting barrier over outstanding sub-tasks
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `n` more outstanding sub-tasks
    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark one sub-task finished, waking waiters when none are left
    pub fn done(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until the count drops to zero
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait with an optional bound; `false` when the bound elapsed first
    pub async fn wait_timeout(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.wait()).await.is_ok(),
            None => {
                self.wait().await;
                true
            }
        }
    }
}
