//! Render worker: visualization products from processed volumes.
//!
//! Candidates come from the catalogue join of completed volumes against
//! their product rows; each is claimed individually so multiple renderers
//! can run against the same store. Unlike the converter, the renderer
//! tolerates effectively-complete volumes: configured fields missing from
//! the container are skipped, and the product only fails when nothing at
//! all could be plotted.

pub mod fields;
pub mod plot;

use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{FieldScale, Settings};
use crate::error::{FailureKind, PipelineResult};
use crate::filename::product_path;
use crate::state::{ProcessingStatus, StateStore, VolumeRow};
use crate::supervisor::Heartbeat;
use fields::{QcThresholds, COLMAX_FIELD};
use plot::PlotSpec;

pub struct Renderer {
    settings: Arc<Settings>,
    store: Arc<StateStore>,
    shutdown: watch::Receiver<bool>,
    heartbeat: Heartbeat,
}

impl Renderer {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<StateStore>,
        shutdown: watch::Receiver<bool>,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            settings,
            store,
            shutdown,
            heartbeat,
        }
    }

    pub async fn run(mut self) {
        info!(
            product_type = %self.settings.renderer.product_type,
            "Starting render worker"
        );
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.cycle().await {
                warn!(error = %e, "Render cycle failed");
            }
            self.heartbeat.touch();
            tokio::select! {
                _ = tokio::time::sleep(self.settings.tuning.poll_interval()) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!("Render worker stopped");
    }

    /// One cycle: claim and render every volume awaiting products.
    pub async fn cycle(&self) -> PipelineResult<()> {
        let product_type = &self.settings.renderer.product_type;
        let candidates = self.store.list_volumes_for_rendering(product_type)?;
        if candidates.is_empty() {
            debug!("No volumes ready for rendering");
            return Ok(());
        }
        info!(count = candidates.len(), "Rendering volumes");

        let semaphore = Arc::new(Semaphore::new(self.settings.tuning.max_concurrent_renders));
        let mut tasks = JoinSet::new();
        for volume in candidates {
            if *self.shutdown.borrow() {
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let settings = self.settings.clone();
            let store = self.store.clone();
            tasks.spawn(async move {
                let _permit = permit;
                render_volume(settings, store, volume).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Render task aborted");
            }
        }
        Ok(())
    }
}

/// Claim one volume's product slot and drive it to a terminal state.
async fn render_volume(settings: Arc<Settings>, store: Arc<StateStore>, volume: VolumeRow) {
    let product_type = settings.renderer.product_type.clone();
    match store.claim_product(&volume.volume_id, &product_type) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            warn!(volume_id = %volume.volume_id, error = %e, "Product claim failed");
            return;
        }
    }

    // plotting is CPU-bound; keep it off the async scheduler
    let outcome = {
        let settings = settings.clone();
        let volume_clone = volume.clone();
        tokio::task::spawn_blocking(move || generate_products(&settings, &volume_clone)).await
    };

    let status = match outcome {
        Ok(Ok(plotted)) => {
            info!(volume_id = %volume.volume_id, plotted, "Products generated");
            store.mark_product_status(
                &volume.volume_id,
                &product_type,
                ProcessingStatus::Completed,
                None,
            )
        }
        Ok(Err((kind, message))) => {
            warn!(volume_id = %volume.volume_id, %kind, message, "Product generation failed");
            store.mark_product_status(
                &volume.volume_id,
                &product_type,
                ProcessingStatus::Failed,
                Some((kind, &message)),
            )
        }
        Err(join_err) => store.mark_product_status(
            &volume.volume_id,
            &product_type,
            ProcessingStatus::Failed,
            Some((FailureKind::Plot, &join_err.to_string())),
        ),
    };
    if let Err(e) = status {
        warn!(volume_id = %volume.volume_id, error = %e, "Failed to record product status");
    }
}

/// Read, standardize, derive, and plot. Returns the number of rasters
/// written, or a classified failure.
fn generate_products(
    settings: &Settings,
    volume: &VolumeRow,
) -> Result<usize, (FailureKind, String)> {
    let Some(container) = &volume.output_path else {
        return Err((
            FailureKind::FileNotFound,
            format!("volume {} has no output container", volume.volume_id),
        ));
    };
    if !container.exists() {
        return Err((
            FailureKind::FileNotFound,
            format!("{} missing on disk", container.display()),
        ));
    }

    let mut radar = crate::decode::writer::read_container(container)
        .map_err(|e| (FailureKind::ReadError, e.to_string()))?;

    fields::standardize_field_names(&mut radar)
        .map_err(|e| (FailureKind::Standardize, e.to_string()))?;

    let thresholds = QcThresholds {
        rhohv_min: settings.renderer.rhohv_min,
        wrad_max: settings.renderer.wrad_max,
        zdr_max: settings.renderer.zdr_max,
    };
    let selection = fields::determine_reflectivity(&radar);

    let mut to_plot = settings.renderer.fields.clone();
    if settings.renderer.add_colmax && settings.renderer.product_type == "image" {
        if let Some(source) = &selection.horizontal {
            match fields::add_column_max(
                &mut radar,
                source,
                settings.renderer.colmax_elev_limit,
                &thresholds,
            ) {
                Ok(()) => to_plot.push(COLMAX_FIELD.to_string()),
                // plotting proceeds without the derived field
                Err(e) => warn!(volume_id = %volume.volume_id, error = %e, "Column max failed"),
            }
        }
    }

    let sweep = radar.lowest_sweep();
    let mask = fields::qc_mask(&radar, &thresholds);
    let fallback = FieldScale {
        vmin: -20.0,
        vmax: 70.0,
    };

    let mut plotted = 0usize;
    for field in &to_plot {
        if !radar.fields.contains_key(field) {
            debug!(field, "Field absent from container, skipping");
            continue;
        }
        let scale = settings
            .renderer
            .scales
            .get(field)
            .copied()
            .unwrap_or(fallback);
        let spec = PlotSpec {
            size: settings.renderer.image_size,
            vmin: scale.vmin,
            vmax: scale.vmax,
        };

        // unfiltered variant carries the 'o' suffix, filtered the plain name
        let variants: [(String, Option<&[bool]>); 2] = [
            (format!("{field}o"), None),
            (field.clone(), Some(mask.as_slice())),
        ];
        for (name, variant_mask) in variants {
            match plot::rasterize_ppi(&radar, field, sweep, &spec, variant_mask) {
                Ok(img) => {
                    let path = product_path(
                        &settings.directories.product_root,
                        &volume.radar,
                        volume.observation_instant,
                        &name,
                        sweep,
                    );
                    match plot::save_png(&img, &path) {
                        Ok(()) => plotted += 1,
                        Err(e) => {
                            warn!(field = %name, error = %e, "Failed to save raster")
                        }
                    }
                }
                Err(e) => warn!(field = %name, error = %e, "Failed to rasterize"),
            }
        }
    }

    if plotted == 0 {
        return Err((
            FailureKind::Plot,
            "no fields were successfully plotted".to_string(),
        ));
    }
    Ok(plotted)
}
