//! Periodic statistics push.

use crate::metrics::StatisticsGauges;
use crate::service::QueryCacheService;
use crate::stats::RunningStatistics;
use memora_config::CacheConfig;
use memora_core::{MemoraError, MemoraResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Background task pushing statistics gauges on a fixed interval.
///
/// Each tick first sweeps expired entries, then takes a snapshot and sets
/// the gauges. No cache lock is held while the metrics recorder runs.
pub struct StatisticsReporter {
    service: Arc<QueryCacheService>,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
}

impl StatisticsReporter {
    pub fn new(service: Arc<QueryCacheService>, interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            service,
            interval,
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a reporter ticking every `stats_push_interval_secs`.
    pub fn from_config(service: Arc<QueryCacheService>, config: &CacheConfig) -> Self {
        Self::new(service, config.stats_push_interval())
    }

    /// Push interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Takes one snapshot and publishes it.
    pub fn report_once(&self) -> RunningStatistics {
        let snapshot = self.service.get_statistics();
        let tracked = self.service.tracked_entries();
        StatisticsGauges::publish(self.service.instance_id(), &snapshot, tracked);
        debug!(
            instance_id = %self.service.instance_id(),
            total_queries = snapshot.total_queries,
            hit_rate = snapshot.hit_rate,
            "Published cache statistics"
        );
        snapshot
    }

    /// Runs until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> MemoraResult<()> {
        // Subscribed before the flag is set: a stop sent once
        // `is_running()` is true always reaches this loop.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MemoraError::Internal(
                "Statistics reporter already running".to_string(),
            ));
        }

        info!(
            instance_id = %self.service.instance_id(),
            interval_secs = self.interval.as_secs_f64(),
            "Starting statistics reporter"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(instance_id = %self.service.instance_id(), "Statistics reporter received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.service.purge_expired().await;
                    self.report_once();
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(error = %e, "Statistics reporter failed");
            }
        })
    }

    /// Signals the loop to exit.
    pub fn stop(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Statistics reporter not listening for shutdown");
        }
    }
}
