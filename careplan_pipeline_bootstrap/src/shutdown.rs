// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Shutdown Coordination
//!
//! Graceful shutdown for the worker pools and background sweepers. A
//! [`CancellationToken`] is cloned into every task; the pipeline checks it
//! at each suspension point (stage boundaries, queue claims, sweeper
//! ticks), so in-flight work stops promptly without dropping a job
//! mid-acknowledge.
//!
//! The [`ShutdownCoordinator`] owns the root token and enforces a grace
//! period: tasks that have not finished when it elapses are abandoned to
//! process exit.
//!
//! ## Usage
//!
//! ```rust
//! use careplan_pipeline_bootstrap::shutdown::ShutdownCoordinator;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
//! let token = coordinator.token();
//!
//! tokio::spawn(async move {
//!     loop {
//!         tokio::select! {
//!             _ = token.cancelled() => break,
//!             _ = tokio::time::sleep(Duration::from_millis(100)) => { /* work */ }
//!         }
//!     }
//! });
//!
//! coordinator.initiate_shutdown();
//! coordinator.wait_for_shutdown().await;
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Default grace period for graceful shutdown (in seconds)
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

/// Clone-able cancellation token observed by worker tasks.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Cancel this token, waking every waiter.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Check if cancelled (non-blocking).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait for cancellation.
    pub async fn cancelled(&self) {
        // Fast path; then wait for a notification, re-checking to close the
        // race between the check and registering as a waiter.
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }

    /// A token that is never cancelled, for tests and one-shot tools.
    pub fn never() -> Self {
        Self::new()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinates shutdown across application components.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace_period: Duration,
    active_tasks: Arc<AtomicU32>,
    all_done: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace_period,
            active_tasks: Arc::new(AtomicU32::new(0)),
            all_done: Arc::new(Notify::new()),
        }
    }

    /// The root token; clone it into every task.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Registers a unit of work that shutdown should wait for. The guard
    /// deregisters on drop.
    pub fn register_task(&self) -> TaskGuard {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            active_tasks: Arc::clone(&self.active_tasks),
            all_done: Arc::clone(&self.all_done),
        }
    }

    /// Signals every token holder to stop.
    pub fn initiate_shutdown(&self) {
        self.token.cancel();
    }

    /// Waits for registered tasks to drain, up to the grace period.
    /// Returns `true` if everything finished in time.
    pub async fn wait_for_shutdown(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.grace_period;
        while self.active_tasks.load(Ordering::SeqCst) > 0 {
            let waiter = self.all_done.notified();
            if self.active_tasks.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::select! {
                _ = waiter => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.active_tasks.load(Ordering::SeqCst) == 0;
                }
            }
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS))
    }
}

/// Drop guard for one registered task.
pub struct TaskGuard {
    active_tasks: Arc<AtomicU32>,
    all_done: Arc<Notify>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.active_tasks.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.all_done.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_starts_uncancelled() {
        let token = CancellationToken::never();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let token = coordinator.token();
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
            true
        });
        coordinator.initiate_shutdown();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_drains_registered_tasks() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
        let guard = coordinator.register_task();
        let token = coordinator.token();
        tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        coordinator.initiate_shutdown();
        assert!(coordinator.wait_for_shutdown().await);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_stuck_task() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let _guard = coordinator.register_task();
        coordinator.initiate_shutdown();
        assert!(!coordinator.wait_for_shutdown().await);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let token = CancellationToken::never();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
