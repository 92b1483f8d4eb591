//! Lifecycle Manager - Background tasks for the ingestion pipeline
//!
//! Handles:
//! - Idle-queue reclamation on a fixed schedule after an initial delay
//! - Shutdown signalling to the background tasks

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rp_config::ReclamationConfig;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::reclamation::IdleQueueReclaimer;

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub reclamation_enabled: bool,
    /// Delay before the first reclamation sweep
    pub reclamation_initial_delay: Duration,
    /// Interval between reclamation sweeps
    pub reclamation_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reclamation_enabled: true,
            reclamation_initial_delay: Duration::from_secs(60),
            reclamation_interval: Duration::from_secs(300),  // 5 minutes
        }
    }
}

impl From<&ReclamationConfig> for LifecycleConfig {
    fn from(config: &ReclamationConfig) -> Self {
        Self {
            reclamation_enabled: config.enabled,
            reclamation_initial_delay: config.initial_delay(),
            reclamation_interval: config.interval(),
        }
    }
}

/// Manages lifecycle tasks for the ingestion pipeline
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks
    pub fn start(reclaimer: Arc<IdleQueueReclaimer>, config: LifecycleConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::new();

        // Idle-queue reclamation
        if config.reclamation_enabled {
            let mut shutdown_rx = shutdown_tx.subscribe();
            let start = Instant::now() + config.reclamation_initial_delay;
            let interval = config.reclamation_interval;

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(start, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            debug!("Running idle queue reclamation");
                            if let Err(e) = reclaimer.sweep().await {
                                error!(error = %e, "Idle queue reclamation failed");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Idle queue reclamation shutting down");
                            break;
                        }
                    }
                }
            }));
        } else {
            info!("Idle queue reclamation disabled");
        }

        info!("Lifecycle manager started with all background tasks");

        Self {
            shutdown_tx,
            handles: Mutex::new(handles),
        }
    }

    /// Signal shutdown to all lifecycle tasks and wait for them to stop
    pub async fn shutdown(&self) {
        info!("Lifecycle manager shutting down...");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LifecycleConfig::default();
        assert!(config.reclamation_enabled);
        assert_eq!(config.reclamation_initial_delay, Duration::from_secs(60));
        assert_eq!(config.reclamation_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_from_reclamation_config() {
        let config = LifecycleConfig::from(&ReclamationConfig {
            enabled: false,
            initial_delay_secs: 5,
            interval_secs: 30,
        });
        assert!(!config.reclamation_enabled);
        assert_eq!(config.reclamation_initial_delay, Duration::from_secs(5));
        assert_eq!(config.reclamation_interval, Duration::from_secs(30));
    }
}
