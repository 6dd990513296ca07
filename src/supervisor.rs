//! Worker lifecycle: startup, draining, stuck-work recovery, statistics.
//!
//! The supervisor owns the three stage workers plus the periodic sweeper.
//! A `watch` channel carries the draining flag every worker observes at
//! its loop boundary; on shutdown the supervisor waits a bounded grace
//! period for in-flight items, then aborts stragglers. The state store is
//! released last.
//!
//! Two paths lead to exit: an interrupt signal, or — when an end instant
//! is configured — the Fetcher reporting the window drained, followed by
//! every reachable volume and product settling into a terminal state.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::Settings;
use crate::decode::{Converter, VolumeDecoder};
use crate::error::PipelineResult;
use crate::fetch::Fetcher;
use crate::remote::RemoteStore;
use crate::render::Renderer;
use crate::state::{StateStore, StoreStats};

/// Last-activity marker a worker touches once per loop iteration.
#[derive(Clone, Default)]
pub struct Heartbeat(Arc<AtomicI64>);

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self) {
        self.0.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Seconds since the last touch; `None` before the first cycle.
    pub fn age_secs(&self) -> Option<i64> {
        let last = self.0.load(Ordering::Relaxed);
        (last > 0).then(|| Utc::now().timestamp() - last)
    }
}

/// Liveness markers for every worker loop.
#[derive(Clone, Default)]
pub struct WorkerHealth {
    pub fetcher: Heartbeat,
    pub converter: Heartbeat,
    pub renderer: Heartbeat,
    pub sweeper: Heartbeat,
}

/// Polling statistics view: catalogue counts plus worker liveness.
#[derive(Debug, Serialize)]
pub struct PipelineStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub fetcher_age_secs: Option<i64>,
    pub converter_age_secs: Option<i64>,
    pub renderer_age_secs: Option<i64>,
}

/// Terminal outcome of a supervisor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The configured window was exhausted and all work reached a
    /// terminal state.
    Drained,
    /// An interrupt requested shutdown.
    Interrupted,
}

pub struct Supervisor {
    settings: Arc<Settings>,
    store: Arc<StateStore>,
    remote: Arc<dyn RemoteStore>,
    decoder: Arc<dyn VolumeDecoder>,
    health: WorkerHealth,
}

impl Supervisor {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<StateStore>,
        remote: Arc<dyn RemoteStore>,
        decoder: Arc<dyn VolumeDecoder>,
    ) -> Self {
        Self {
            settings,
            store,
            remote,
            decoder,
            health: WorkerHealth::default(),
        }
    }

    pub fn health(&self) -> &WorkerHealth {
        &self.health
    }

    pub fn stats(&self) -> PipelineResult<PipelineStats> {
        Ok(PipelineStats {
            store: self.store.stats()?,
            fetcher_age_secs: self.health.fetcher.age_secs(),
            converter_age_secs: self.health.converter.age_secs(),
            renderer_age_secs: self.health.renderer.age_secs(),
        })
    }

    /// Run all workers until shutdown, then drain them.
    pub async fn run(self) -> PipelineResult<ExitStatus> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (drained_tx, mut drained_rx) = mpsc::channel::<()>(1);

        let fetcher = Fetcher::new(
            self.settings.clone(),
            self.store.clone(),
            self.remote.clone(),
            shutdown_rx.clone(),
            drained_tx,
            self.health.fetcher.clone(),
        );
        let converter = Converter::new(
            self.settings.clone(),
            self.store.clone(),
            self.decoder.clone(),
            shutdown_rx.clone(),
            self.health.converter.clone(),
        );
        let renderer = Renderer::new(
            self.settings.clone(),
            self.store.clone(),
            shutdown_rx.clone(),
            self.health.renderer.clone(),
        );

        let mut workers = vec![
            ("fetch", tokio::spawn(fetcher.run())),
            ("decode", tokio::spawn(converter.run())),
            ("render", tokio::spawn(renderer.run())),
            (
                "sweeper",
                tokio::spawn(sweeper(
                    self.settings.clone(),
                    self.store.clone(),
                    self.health.clone(),
                    shutdown_rx,
                )),
            ),
        ];
        info!("All workers started");

        let exit = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Interrupt handler failed, draining");
                }
                info!("Interrupt received");
                ExitStatus::Interrupted
            }
            _ = async {
                drained_rx.recv().await;
                self.wait_for_terminal().await;
            } => {
                info!("Pipeline drained");
                ExitStatus::Drained
            }
        };

        info!("Draining workers");
        let _ = shutdown_tx.send(true);
        let grace = self.settings.tuning.shutdown_grace();
        for (name, mut handle) in workers.drain(..) {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(worker = name, error = %e, "Worker ended abnormally"),
                Err(_) => {
                    warn!(worker = name, "Worker exceeded grace period, aborting");
                    handle.abort();
                }
            }
        }

        match self.stats() {
            Ok(stats) => info!(
                stats = %serde_json::to_string(&stats).unwrap_or_default(),
                "Final statistics"
            ),
            Err(e) => warn!(error = %e, "Could not read final statistics"),
        }
        // dropping the supervisor releases the store last
        Ok(exit)
    }

    /// After the window drains, wait until nothing actionable remains:
    /// no partials, no claimable or in-flight volumes, no rendering
    /// candidates, no in-flight products.
    async fn wait_for_terminal(&self) {
        let product_type = &self.settings.renderer.product_type;
        loop {
            let settled = (|| -> PipelineResult<bool> {
                Ok(self.store.pending_partial_count()? == 0
                    && self.store.actionable_volume_count()? == 0
                    && self.store.list_volumes_for_rendering(product_type)?.is_empty()
                    && self.store.stats()?.products_processing == 0)
            })();
            match settled {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Terminal-state check failed"),
            }
            tokio::time::sleep(self.settings.tuning.poll_interval()).await;
        }
    }
}

/// Periodic stuck-work recovery plus a statistics heartbeat log.
async fn sweeper(
    settings: Arc<Settings>,
    store: Arc<StateStore>,
    health: WorkerHealth,
    mut shutdown: watch::Receiver<bool>,
) {
    let timeout = settings.tuning.stuck_timeout();
    info!(
        interval_secs = settings.tuning.sweep_interval_secs,
        stuck_timeout_minutes = settings.tuning.stuck_timeout_minutes,
        "Starting stuck-work sweeper"
    );
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = store.reset_stuck_volumes(timeout) {
            warn!(error = %e, "Stuck volume sweep failed");
        }
        if let Err(e) = store.reset_stuck_products(timeout) {
            warn!(error = %e, "Stuck product sweep failed");
        }
        match store.stats() {
            Ok(stats) => info!(
                files = stats.files_completed,
                partials = stats.partial_downloads,
                volumes_pending = stats.volumes_pending,
                volumes_completed = stats.volumes_completed,
                volumes_failed = stats.volumes_failed,
                products_completed = stats.products_completed,
                "Catalogue snapshot"
            ),
            Err(e) => warn!(error = %e, "Statistics snapshot failed"),
        }
        health.sweeper.touch();
        tokio::select! {
            _ = tokio::time::sleep(settings.tuning.sweep_interval()) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!("Sweeper stopped");
}
