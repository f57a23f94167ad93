//! Background maintenance loop
//!
//! Runs periodically and cooperatively:
//! - Health-probes every backend and drives the registry state machine
//! - Enforces cache tier budgets (demotion, eviction, archive sweeps)
//! - Closes hourly metrics buckets and persists them best-effort
//! - Sweeps terminal jobs past their retention windows
//!
//! Probes run concurrently under their own timeout so a slow backend never
//! starves cache or metrics work. Loop errors are logged and never affect
//! foreground traffic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::shared::keys;
use crate::cache::{SharedStore, TieredCache};
use crate::config::MaintenanceConfig;
use crate::metrics::MetricsStore;
use crate::queue::QueueManager;
use crate::registry::BackendRegistry;

/// The periodic maintenance driver
pub struct MaintenanceLoop {
    registry: Arc<BackendRegistry>,
    metrics: Arc<MetricsStore>,
    cache: Arc<TieredCache>,
    queue: Arc<QueueManager>,
    shared: Option<Arc<dyn SharedStore>>,
    config: MaintenanceConfig,
}

impl MaintenanceLoop {
    /// Assemble the loop over the shared subsystems
    pub fn new(
        registry: Arc<BackendRegistry>,
        metrics: Arc<MetricsStore>,
        cache: Arc<TieredCache>,
        queue: Arc<QueueManager>,
        shared: Option<Arc<dyn SharedStore>>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            cache,
            queue,
            shared,
            config,
        }
    }

    /// Spawn the loop; it runs until the shutdown signal flips
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            self.probe_backends().await;
            self.cache.enforce_budgets().await;
            self.rollup_metrics().await;

            let swept = self.queue.sweep_expired(Utc::now());
            if swept > 0 {
                log::debug!("swept {} expired job records", swept);
            }
        }

        log::debug!("maintenance loop stopped");
    }

    /// Probe every backend concurrently under the probe timeout
    async fn probe_backends(&self) {
        let snapshots = self.registry.list().await;
        let timeout = Duration::from_secs(self.config.probe_timeout_secs.max(1));

        let probes = snapshots.into_iter().map(|snapshot| {
            let registry = Arc::clone(&self.registry);
            async move {
                let backend_id = snapshot.spec.id;
                let Some(handler) = registry.handler(&backend_id).await else {
                    return;
                };

                match tokio::time::timeout(timeout, handler.probe()).await {
                    Ok(Ok(())) => registry.record_probe_success(&backend_id).await,
                    Ok(Err(e)) => {
                        log::debug!("probe failed for {}: {}", backend_id, e);
                        registry.record_probe_failure(&backend_id).await;
                    }
                    Err(_) => {
                        log::debug!("probe timed out for {}", backend_id);
                        registry.record_probe_failure(&backend_id).await;
                    }
                }
            }
        });

        futures::future::join_all(probes).await;
    }

    /// Close stale hourly buckets and persist them best-effort
    async fn rollup_metrics(&self) {
        let closed = self.metrics.rollup_check(Utc::now());
        let Some(shared) = &self.shared else {
            return;
        };

        for (backend_id, rollup) in closed {
            let Ok(bytes) = serde_json::to_vec(&rollup) else {
                continue;
            };
            let key = keys::backend_metrics(&backend_id, rollup.hour_epoch);
            if let Err(e) = shared
                .put(&key, bytes, Some(Duration::from_secs(25 * 3600)))
                .await
            {
                log::debug!("metrics persistence failed for {}: {}", key, e);
            }
        }
    }
}
