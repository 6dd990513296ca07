//! Configuration management for the ingestion pipeline.
//!
//! Settings are loaded from a TOML file with the `config` crate and
//! deserialized via `serde`. Environment variables prefixed with
//! `RADAR_INGEST_` override file values (`RADAR_INGEST_CONNECTION__HOST`
//! overrides `[connection].host`).
//!
//! ## Schema
//!
//! - **`log_level`**: tracing verbosity (e.g. "info", "debug").
//! - **`connection`**: remote server host, credentials, and base path.
//! - **`radar`**: the radar code being monitored.
//! - **`window`**: calendar window (`start_instant`, optional `end_instant`).
//!   An unset `end_instant` means continuous operation.
//! - **`directories`**: raw-download root, container root, product root,
//!   decoder resources, state-store path.
//! - **`volumes`**: the expectation map
//!   `{volume_code -> {volume_number -> [field, ...]}}`.
//! - **`tuning`**: poll intervals, concurrency caps, verification and
//!   retry knobs.
//! - **`renderer`**: product type, field list, derived-field and filter
//!   thresholds.
//!
//! ## Validation
//!
//! `Settings::new` loads and deserializes, then calls `validate()`. A
//! validation failure is fatal: the process must not start with a radar
//! code it cannot parse files for or an expectation map it cannot satisfy.

use chrono::{DateTime, Utc};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};

/// Expectation map: volume code -> volume number -> ordered field list.
pub type VolumeExpectations = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub connection: ConnectionSettings,
    pub radar: RadarSettings,
    pub window: WindowSettings,
    pub directories: DirectorySettings,
    /// Expectation map; a volume is complete when its downloaded fields
    /// cover the list registered for its `(vol_code, vol_num)`.
    pub volumes: VolumeExpectations,
    pub tuning: TuningSettings,
    pub renderer: RendererSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            connection: ConnectionSettings::default(),
            radar: RadarSettings::default(),
            window: WindowSettings::default(),
            directories: DirectorySettings::default(),
            volumes: VolumeExpectations::new(),
            tuning: TuningSettings::default(),
            renderer: RendererSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub username: String,
    pub password: String,
    /// Remote base path the calendar hierarchy hangs under.
    pub base_path: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: "anonymous".to_string(),
            password: String::new(),
            base_path: "/L2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RadarSettings {
    /// Radar code, e.g. "RMA1". Filenames not starting with this code are
    /// ignored during traversal.
    pub name: String,
    /// Remote file extension accepted by the walker.
    pub extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    /// First instant of interest. Required.
    pub start_instant: Option<DateTime<Utc>>,
    /// Optional closed end of the window; unset means continuous.
    pub end_instant: Option<DateTime<Utc>>,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            start_instant: None,
            end_instant: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    pub raw_root: PathBuf,
    pub container_root: PathBuf,
    pub product_root: PathBuf,
    pub decoder_resources: PathBuf,
    pub state_db: PathBuf,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            raw_root: PathBuf::from("./data/raw"),
            container_root: PathBuf::from("./data/volumes"),
            product_root: PathBuf::from("./data/products"),
            decoder_resources: PathBuf::from("./resources"),
            state_db: PathBuf::from("./data/state.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningSettings {
    /// Seconds between traversal sweeps once caught up.
    pub poll_interval_secs: u64,
    pub max_concurrent_downloads: usize,
    pub max_concurrent_decodes: usize,
    pub max_concurrent_renders: usize,
    /// Compare the server-reported size with the received byte count.
    pub verify_checksums: bool,
    /// Keep `.part` files across attempts instead of deleting them.
    pub resume_partial: bool,
    /// Remote listing timeout (seconds).
    pub listing_timeout_secs: u64,
    /// Inactivity timeout for one download (seconds).
    pub download_timeout_secs: u64,
    /// In-sweep download retry budget.
    pub download_max_retries: u32,
    pub download_base_delay_ms: u64,
    pub download_max_delay_ms: u64,
    /// Per-volume decoder retry budget.
    pub decode_max_retries: u32,
    pub decode_base_delay_ms: u64,
    pub decode_max_delay_ms: u64,
    /// Minutes after which a `processing` row counts as stuck.
    pub stuck_timeout_minutes: i64,
    /// Seconds between stuck-work sweeps.
    pub sweep_interval_secs: u64,
    /// Seconds the supervisor waits for workers to finish their current
    /// item after the draining flag is raised.
    pub shutdown_grace_secs: u64,
    /// Accept incomplete volumes for decoding once they are older than
    /// `incomplete_timeout_hours`. Off by default: the baseline never
    /// decodes an incomplete volume.
    pub allow_incomplete: bool,
    pub incomplete_timeout_hours: i64,
}

impl Default for TuningSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            max_concurrent_downloads: 5,
            max_concurrent_decodes: 2,
            max_concurrent_renders: 1,
            verify_checksums: true,
            resume_partial: false,
            listing_timeout_secs: 30,
            download_timeout_secs: 60,
            download_max_retries: 3,
            download_base_delay_ms: 1_000,
            download_max_delay_ms: 30_000,
            decode_max_retries: 3,
            decode_base_delay_ms: 500,
            decode_max_delay_ms: 60_000,
            stuck_timeout_minutes: 60,
            sweep_interval_secs: 300,
            shutdown_grace_secs: 30,
            allow_incomplete: false,
            incomplete_timeout_hours: 24,
        }
    }
}

impl TuningSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn stuck_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stuck_timeout_minutes)
    }
}

/// Display scaling for one rendered field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FieldScale {
    pub vmin: f32,
    pub vmax: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    /// Product type tracked per volume, e.g. "image".
    pub product_type: String,
    /// Add the column-maximum reflectivity derived field before plotting.
    pub add_colmax: bool,
    /// Sweeps below this fixed angle are excluded from the column maximum.
    pub colmax_elev_limit: f32,
    /// Fields to render; fields absent from a container are skipped.
    pub fields: Vec<String>,
    /// Per-field display ranges; fields without an entry use the
    /// reflectivity range.
    pub scales: BTreeMap<String, FieldScale>,
    /// Quality-control thresholds applied in the filtered variant.
    pub rhohv_min: f32,
    pub wrad_max: f32,
    pub zdr_max: f32,
    /// Output raster edge length in pixels.
    pub image_size: u32,
}

impl Default for RendererSettings {
    fn default() -> Self {
        let mut scales = BTreeMap::new();
        scales.insert("DBZH".into(), FieldScale { vmin: -20.0, vmax: 70.0 });
        scales.insert("DBZV".into(), FieldScale { vmin: -20.0, vmax: 70.0 });
        scales.insert("COLMAX".into(), FieldScale { vmin: -20.0, vmax: 70.0 });
        scales.insert("RHOHV".into(), FieldScale { vmin: 0.0, vmax: 1.0 });
        scales.insert("PHIDP".into(), FieldScale { vmin: -5.0, vmax: 360.0 });
        scales.insert("KDP".into(), FieldScale { vmin: -4.0, vmax: 8.0 });
        scales.insert("ZDR".into(), FieldScale { vmin: -7.5, vmax: 7.5 });
        scales.insert("VRAD".into(), FieldScale { vmin: -30.0, vmax: 30.0 });
        scales.insert("WRAD".into(), FieldScale { vmin: -2.0, vmax: 6.0 });
        Self {
            product_type: "image".to_string(),
            add_colmax: true,
            colmax_elev_limit: 0.65,
            fields: vec![
                "DBZH".into(),
                "DBZV".into(),
                "VRAD".into(),
                "WRAD".into(),
                "RHOHV".into(),
                "ZDR".into(),
            ],
            scales,
            rhohv_min: 0.8,
            wrad_max: 4.6,
            zdr_max: 8.5,
            image_size: 600,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus environment overrides.
    /// Sections absent from both fall back to the serde defaults.
    pub fn new(config_path: Option<&Path>) -> PipelineResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("RADAR_INGEST")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what deserialization can express.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.connection.host.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "connection.host must not be empty".into(),
            ));
        }
        if self.radar.name.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "radar.name must not be empty".into(),
            ));
        }
        if self.radar.extension.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "radar.extension must not be empty".into(),
            ));
        }
        if self.window.start_instant.is_none() {
            return Err(PipelineError::Configuration(
                "window.start_instant must be set".into(),
            ));
        }
        if let (Some(start), Some(end)) = (self.window.start_instant, self.window.end_instant) {
            if end < start {
                return Err(PipelineError::Configuration(format!(
                    "window.end_instant ({end}) is before window.start_instant ({start})"
                )));
            }
        }
        if self.volumes.is_empty() {
            return Err(PipelineError::Configuration(
                "volumes expectation map must not be empty".into(),
            ));
        }
        for (code, nums) in &self.volumes {
            for (num, fields) in nums {
                if fields.is_empty() {
                    return Err(PipelineError::Configuration(format!(
                        "volumes.{code}.{num} declares no expected fields"
                    )));
                }
            }
        }
        if self.tuning.max_concurrent_downloads == 0
            || self.tuning.max_concurrent_decodes == 0
            || self.tuning.max_concurrent_renders == 0
        {
            return Err(PipelineError::Configuration(
                "concurrency limits must be at least 1".into(),
            ));
        }
        if self.renderer.image_size < 64 {
            return Err(PipelineError::Configuration(
                "renderer.image_size must be at least 64".into(),
            ));
        }
        Ok(())
    }

    /// First instant of the configured window.
    ///
    /// `validate()` guarantees presence; this accessor keeps call sites free
    /// of repeated `Option` plumbing.
    pub fn start_instant(&self) -> DateTime<Utc> {
        self.window.start_instant.unwrap_or_else(Utc::now)
    }

    /// Expected field list for one `(vol_code, vol_num)` pair, if configured.
    pub fn expected_fields(&self, vol_code: &str, vol_num: &str) -> Option<&[String]> {
        self.volumes
            .get(vol_code)
            .and_then(|nums| nums.get(vol_num))
            .map(|v| v.as_slice())
    }
}
