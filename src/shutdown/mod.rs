//! Graceful shutdown for the realtime client.
//!
//! 1. Signals background tasks (time sync probe) to stop
//! 2. Stops the hub connection, bounded by a timeout
//! 3. Waits for the background tasks to finish

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::connection_manager::ConnectionManager;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for closing the hub connection (default: 5 seconds)
    pub stop_timeout: Duration,
    /// Time allowed for background tasks to exit (default: 5 seconds)
    pub task_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            task_timeout: Duration::from_secs(5),
        }
    }
}

pub struct GracefulShutdown {
    connection_manager: Arc<ConnectionManager>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(connection_manager: Arc<ConnectionManager>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(connection_manager, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        connection_manager: Arc<ConnectionManager>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            connection_manager,
            shutdown_tx,
            tasks: Vec::new(),
            config,
        }
    }

    /// Track a background task that listens on the shutdown channel
    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(state = %self.connection_manager.state())
    )]
    pub async fn execute(self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult {
            interest_dropped: self.connection_manager.stats().interest_count,
            ..Default::default()
        };

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling background tasks");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 2: Stopping hub connection");
        result.connection_stopped = timeout(self.config.stop_timeout, self.connection_manager.stop())
            .await
            .is_ok();
        if !result.connection_stopped {
            tracing::warn!(
                timeout_ms = self.config.stop_timeout.as_millis() as u64,
                "Hub connection did not stop in time"
            );
        }

        tracing::info!(tasks = self.tasks.len(), "Phase 3: Waiting for background tasks");
        result.tasks_finished = self.wait_for_tasks().await;

        result.duration = start.elapsed();
        result.success = result.connection_stopped;

        tracing::info!(
            connection_stopped = result.connection_stopped,
            interest_dropped = result.interest_dropped,
            tasks_finished = result.tasks_finished,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    async fn wait_for_tasks(self) -> usize {
        if self.tasks.is_empty() {
            return 0;
        }

        let aborts: Vec<_> = self.tasks.iter().map(|task| task.abort_handle()).collect();
        match timeout(self.config.task_timeout, join_all(self.tasks)).await {
            Ok(results) => results.iter().filter(|r| r.is_ok()).count(),
            Err(_) => {
                tracing::warn!("Background tasks did not exit in time; aborting");
                for abort in aborts {
                    abort.abort();
                }
                0
            }
        }
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    /// Whether the hub connection closed within the stop timeout
    pub connection_stopped: bool,
    /// Tracked items at the time of shutdown
    pub interest_dropped: usize,
    pub tasks_finished: usize,
    pub duration: Duration,
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfig;
    use crate::connection_manager::ConnectionState;

    fn create_test_components() -> (Arc<ConnectionManager>, broadcast::Sender<()>) {
        let config = RealtimeConfig::new("http://127.0.0.1:9/api");
        let cm = Arc::new(ConnectionManager::new(&config));
        let (tx, _) = broadcast::channel(1);
        (cm, tx)
    }

    #[tokio::test]
    async fn test_shutdown_without_connection() {
        let (cm, tx) = create_test_components();
        let shutdown = GracefulShutdown::new(cm.clone(), tx);

        let result = shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.interest_dropped, 0);
        assert_eq!(result.tasks_finished, 0);
        assert_eq!(cm.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_shutdown_signals_tracked_tasks() {
        let (cm, tx) = create_test_components();
        let mut rx = tx.subscribe();
        let mut shutdown = GracefulShutdown::new(cm, tx);
        shutdown.track(tokio::spawn(async move {
            let _ = rx.recv().await;
        }));

        let result = shutdown.execute("test shutdown").await;
        assert_eq!(result.tasks_finished, 1);
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let (cm, tx) = create_test_components();
        let mut shutdown = GracefulShutdown::with_config(
            cm,
            tx,
            ShutdownConfig {
                stop_timeout: Duration::from_secs(1),
                task_timeout: Duration::from_millis(50),
            },
        );
        shutdown.track(tokio::spawn(std::future::pending::<()>()));

        let result = shutdown.execute("test shutdown").await;
        assert!(result.success);
        assert_eq!(result.tasks_finished, 0);
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert_eq!(config.task_timeout, Duration::from_secs(5));
    }
}
