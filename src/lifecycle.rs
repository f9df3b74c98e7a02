// =============================================================================
// Lifecycle — startup repair, background sweep/retention, graceful shutdown
// =============================================================================
//
// Startup: the feed is push-only, so nothing is replayed. Rows left open by
// an unclean exit whose bucket has already ended are marked complete.
//
// Background tasks (each a cancellable interval loop with a kept handle):
//   - sweep:     finalize in-progress candles whose bucket has ended
//   - retention: delete rows older than the retention horizon
//
// Shutdown order: refuse new ticks -> stop tasks -> flush in-progress
// candles -> close the store. Every failure is logged; shutdown always
// runs to completion.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::market_data::CandleAggregator;
use crate::store::CandleStore;

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub sweep_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention_days: u32,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(24 * 3600),
            retention_days: 30,
        }
    }
}

pub struct Lifecycle {
    aggregator: Arc<CandleAggregator>,
    store: Arc<dyn CandleStore>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    stopped: AtomicBool,
}

impl Lifecycle {
    /// Repair stale rows, then launch the sweep and retention tasks.
    pub async fn start(
        aggregator: Arc<CandleAggregator>,
        store: Arc<dyn CandleStore>,
        settings: LifecycleSettings,
    ) -> Self {
        let repaired = repair_incomplete(store.as_ref(), Utc::now().timestamp()).await;
        if repaired > 0 {
            info!(repaired, "closed candles left open by a previous run");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sweep = tokio::spawn(run_sweep(
            aggregator.clone(),
            settings.sweep_interval,
            shutdown_rx.clone(),
        ));
        let retention = tokio::spawn(run_retention(
            store.clone(),
            settings.cleanup_interval,
            settings.retention_days,
            shutdown_rx,
        ));

        info!(
            sweep_secs = settings.sweep_interval.as_secs(),
            cleanup_secs = settings.cleanup_interval.as_secs(),
            retention_days = settings.retention_days,
            "lifecycle tasks started"
        );

        Self {
            aggregator,
            store,
            shutdown_tx,
            tasks: Mutex::new(vec![("sweep", sweep), ("retention", retention)]),
            stopped: AtomicBool::new(false),
        }
    }

    /// Graceful shutdown. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("lifecycle shutdown started");

        self.aggregator.begin_shutdown();

        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "background task ended abnormally");
            }
        }

        let flushed = self.aggregator.flush_all().await;
        info!(flushed, "in-progress candles finalized");

        self.store.close().await;
        info!("lifecycle shutdown complete");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Mark complete every open row whose bucket ended at or before `now`.
pub async fn repair_incomplete(store: &dyn CandleStore, now: i64) -> usize {
    let stale = match store.incomplete_before(now).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "stale candle scan failed");
            return 0;
        }
    };

    let mut repaired = 0;
    for candle in stale {
        match store.mark_complete(&candle.symbol, candle.interval, candle.bucket_start).await {
            Ok(true) => repaired += 1,
            Ok(false) => {}
            Err(e) => warn!(key = %candle.key(), bucket = candle.bucket_start, error = %e, "mark complete failed"),
        }
    }
    repaired
}

async fn run_sweep(aggregator: Arc<CandleAggregator>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let finalized = aggregator.check_and_complete_candles(Utc::now().timestamp()).await;
                if finalized > 0 {
                    info!(finalized, "sweep finalized idle candles");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("sweep task stopped");
}

async fn run_retention(
    store: Arc<dyn CandleStore>,
    every: Duration,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now().timestamp();
                let cutoff = now - i64::from(retention_days) * SECS_PER_DAY;
                match store.delete_older_than(cutoff).await {
                    Ok(removed) => info!(removed, cutoff, "retention cleanup done"),
                    Err(e) => warn!(error = %e, "retention cleanup failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("retention task stopped");
}

// =============================================================================
// Tests
// =============================================================================
