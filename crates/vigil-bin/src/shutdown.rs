// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Graceful shutdown coordination.
//!
//! Handles OS signals (SIGTERM, SIGINT, SIGQUIT) and lets the runtime's
//! background loops subscribe to a single shutdown notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

// =============================================================================
// ShutdownCoordinator
// =============================================================================

/// Coordinates graceful shutdown across the runtime.
///
/// # Example
///
/// ```ignore
/// use vigil_bin::shutdown::ShutdownCoordinator;
///
/// let coordinator = ShutdownCoordinator::new();
/// let signal = coordinator.shutdown_signal();
///
/// tokio::spawn(async move {
///     signal.wait().await;
///     println!("Shutdown received!");
/// });
///
/// coordinator.wait_for_shutdown().await;
/// ```
#[derive(Clone)]
pub struct ShutdownCoordinator {
    sender: broadcast::Sender<()>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    /// Creates a new shutdown coordinator.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribes to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Creates a handle that resolves when shutdown is signaled.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }

    /// Initiates shutdown and notifies all subscribers. Only the first call
    /// has an effect.
    pub fn initiate_shutdown(&self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Shutdown initiated");
            let _ = self.sender.send(());
        }
    }

    /// Returns true if shutdown has been initiated.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Waits for an OS signal or a manual [`initiate_shutdown`](Self::initiate_shutdown).
    pub async fn wait_for_shutdown(&self) {
        let mut manual = self.sender.subscribe();
        if self.is_shutdown_initiated() {
            return;
        }

        tokio::select! {
            _ = manual.recv() => {
                return;
            }
            _ = os_signal() => {}
        }

        self.initiate_shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let registered = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::quit()),
    );

    match registered {
        (Ok(mut sigterm), Ok(mut sigint), Ok(mut sigquit)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = sigquit.recv() => info!("Received SIGQUIT"),
            }
        }
        _ => {
            warn!("Failed to register signal handlers, falling back to Ctrl+C");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn os_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// ShutdownSignal
// =============================================================================

/// Resolves when shutdown is signaled.
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Returns true if shutdown has already been signaled.
    pub fn is_signaled(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Waits for the shutdown signal.
    pub async fn wait(mut self) {
        self.recv().await;
    }

    /// Waits for the shutdown signal without consuming the handle, so it can
    /// be used inside a `select!` loop.
    pub async fn recv(&mut self) {
        if self.is_signaled() {
            return;
        }
        let _ = self.receiver.recv().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_initiate_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutdown_initiated());

        let mut rx = coordinator.subscribe();
        coordinator.initiate_shutdown();
        assert!(coordinator.is_shutdown_initiated());
        assert!(rx.recv().await.is_ok());

        // Second call is a no-op.
        coordinator.initiate_shutdown();
        assert!(coordinator.is_shutdown_initiated());
    }

    #[tokio::test]
    async fn test_shutdown_signal_resolves() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.shutdown_signal();

        let waiter = tokio::spawn(signal.wait());
        coordinator.initiate_shutdown();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("signal should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_after_shutdown_is_immediate() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.initiate_shutdown();

        let mut signal = coordinator.shutdown_signal();
        assert!(signal.is_signaled());
        tokio::time::timeout(Duration::from_millis(100), signal.recv())
            .await
            .expect("already signaled");
    }

    #[tokio::test]
    async fn test_wait_for_manual_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_shutdown().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.initiate_shutdown();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_for_shutdown should return")
            .unwrap();
    }
}
