//! Decode/convert worker: complete volumes in, canonical containers out.
//!
//! For each claimed volume the worker decodes every constituent file
//! through the native decoder adapter (on the blocking pool, with bounded
//! retry), aligns the sub-products onto a common range grid, synthesizes
//! the canonical radar object, and persists it as a single container
//! file. Item-level failures are classified and written to the volume row;
//! the loop itself only stops on the draining flag.

pub mod align;
pub mod ffi;
pub mod radar;
pub mod writer;

pub use ffi::{DecodedVolume, NativeDecoder, VolumeDecoder};
pub use radar::RadarVolume;

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{FailureKind, PipelineResult};
use crate::filename::container_path;
use crate::retry::RetryPolicy;
use crate::state::{StateStore, VolumeRow};
use crate::supervisor::Heartbeat;

pub struct Converter {
    settings: Arc<Settings>,
    store: Arc<StateStore>,
    decoder: Arc<dyn VolumeDecoder>,
    shutdown: watch::Receiver<bool>,
    heartbeat: Heartbeat,
}

impl Converter {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<StateStore>,
        decoder: Arc<dyn VolumeDecoder>,
        shutdown: watch::Receiver<bool>,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            settings,
            store,
            decoder,
            shutdown,
            heartbeat,
        }
    }

    pub async fn run(mut self) {
        info!(
            radar = %self.settings.radar.name,
            max_concurrent = self.settings.tuning.max_concurrent_decodes,
            "Starting decode worker"
        );
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.cycle().await {
                warn!(error = %e, "Decode cycle failed");
            }
            self.heartbeat.touch();
            tokio::select! {
                _ = tokio::time::sleep(self.settings.tuning.poll_interval()) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!("Decode worker stopped");
    }

    /// One cycle: claim and convert every currently eligible volume.
    pub async fn cycle(&self) -> PipelineResult<()> {
        let allow_incomplete = self.settings.tuning.allow_incomplete;
        let cutoff =
            Utc::now() - chrono::Duration::hours(self.settings.tuning.incomplete_timeout_hours);
        let candidates = self.store.claimable_volumes(allow_incomplete, cutoff)?;
        if candidates.is_empty() {
            debug!("No volumes ready for processing");
            return Ok(());
        }
        info!(count = candidates.len(), "Processing volumes");

        let semaphore = Arc::new(Semaphore::new(self.settings.tuning.max_concurrent_decodes));
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
            let decoder = self.decoder.clone();
            tasks.spawn(async move {
                let _permit = permit;
                process_volume(settings, store, decoder, volume).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Volume processing task aborted");
            }
        }
        Ok(())
    }
}

/// Claim one volume and drive it to a terminal state.
async fn process_volume(
    settings: Arc<Settings>,
    store: Arc<StateStore>,
    decoder: Arc<dyn VolumeDecoder>,
    volume: VolumeRow,
) {
    let allow_incomplete = settings.tuning.allow_incomplete;
    match store.claim_volume_for_processing(&volume.volume_id, allow_incomplete) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            warn!(volume_id = %volume.volume_id, error = %e, "Claim failed");
            return;
        }
    }
    info!(
        volume_id = %volume.volume_id,
        complete = volume.is_complete,
        "Processing volume"
    );

    match convert(&settings, &store, decoder, &volume).await {
        Ok(output) => {
            if let Err(e) = store.mark_volume_processed(&volume.volume_id, &output) {
                warn!(volume_id = %volume.volume_id, error = %e, "Failed to mark processed");
            } else {
                info!(volume_id = %volume.volume_id, output = %output.display(), "Volume processed");
            }
        }
        Err((kind, message)) => {
            warn!(volume_id = %volume.volume_id, %kind, message, "Volume failed");
            if let Err(e) = store.mark_volume_failed(&volume.volume_id, kind, &message) {
                warn!(volume_id = %volume.volume_id, error = %e, "Failed to mark failed");
            }
        }
    }
}

/// Decode, align, synthesize, and persist one volume. Errors come back
/// classified so the caller can record them on the row.
async fn convert(
    settings: &Settings,
    store: &StateStore,
    decoder: Arc<dyn VolumeDecoder>,
    volume: &VolumeRow,
) -> Result<PathBuf, (FailureKind, String)> {
    let files = store
        .volume_files(
            &volume.radar,
            &volume.vol_code,
            &volume.vol_num,
            volume.observation_instant,
        )
        .map_err(|e| (FailureKind::IoError, e.to_string()))?;
    if files.is_empty() {
        return Err((
            FailureKind::FileNotFound,
            format!("no completed files for {}", volume.volume_id),
        ));
    }
    for file in &files {
        if !file.local_path.exists() {
            return Err((
                FailureKind::FileNotFound,
                format!("{} missing on disk", file.local_path.display()),
            ));
        }
    }

    let policy = RetryPolicy::new(
        settings.tuning.decode_max_retries,
        std::time::Duration::from_millis(settings.tuning.decode_base_delay_ms),
        std::time::Duration::from_millis(settings.tuning.decode_max_delay_ms),
    );
    let resources = settings.directories.decoder_resources.clone();

    let mut decoded = Vec::with_capacity(files.len());
    for file in &files {
        let result = decode_with_retry(
            decoder.clone(),
            file.local_path.clone(),
            resources.clone(),
            &policy,
        )
        .await
        .map_err(|e| (FailureKind::DecodeFailed, e))?;
        decoded.push(result);
    }

    let aligned = align::align_fields(&decoded)
        .map_err(|e| (FailureKind::GeometryMismatch, e.to_string()))?;
    let meta = decoded[aligned.reference].meta.clone();
    let radar_volume = RadarVolume::from_aligned(aligned, &meta)
        .map_err(|e| (FailureKind::GeometryMismatch, e.to_string()))?;

    let output = container_path(
        &settings.directories.container_root,
        &volume.radar,
        &volume.vol_code,
        &volume.vol_num,
        volume.observation_instant,
    );
    writer::write_container(&radar_volume, &output)
        .map_err(|e| (FailureKind::IoError, e.to_string()))?;
    Ok(output)
}

/// The native routine fails sporadically on valid inputs; retry on the
/// blocking pool with capped exponential backoff before failing the
/// volume.
async fn decode_with_retry(
    decoder: Arc<dyn VolumeDecoder>,
    file: PathBuf,
    resources: PathBuf,
    policy: &RetryPolicy,
) -> Result<DecodedVolume, String> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let decoder = decoder.clone();
        let file_clone = file.clone();
        let resources_clone = resources.clone();
        let outcome =
            tokio::task::spawn_blocking(move || decoder.decode(&file_clone, &resources_clone))
                .await;
        match outcome {
            Ok(Ok(volume)) => return Ok(volume),
            Ok(Err(e)) => {
                warn!(
                    file = %file.display(),
                    attempt,
                    error = %e,
                    "Decoder attempt failed"
                );
                if !policy.should_retry(attempt) {
                    return Err(e.to_string());
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(join_err) => return Err(format!("decoder task aborted: {join_err}")),
        }
    }
}
