//! Shared fixtures: an in-memory remote server and a scripted decoder.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use radar_ingest::config::Settings;
use radar_ingest::decode::ffi::{DecodeError, SweepMeta, VolumeMeta};
use radar_ingest::decode::{DecodedVolume, VolumeDecoder};
use radar_ingest::filename::ParsedFilename;
use radar_ingest::remote::{Fetched, RemoteError, RemoteStore};

/// One file served by the fake remote.
pub struct FakeFile {
    pub content: Vec<u8>,
    /// Size the server claims before the transfer; defaults to the truth.
    pub reported_size: Option<u64>,
    /// Number of initial download attempts that fail with a transport error.
    pub fail_first: AtomicU32,
}

/// In-memory remote tree serving real bytes.
#[derive(Default)]
pub struct FakeRemote {
    dirs: Mutex<BTreeMap<String, Vec<String>>>,
    files: Mutex<HashMap<String, std::sync::Arc<FakeFile>>>,
    pub downloads: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observation file under its calendar-hierarchy path.
    pub fn add_observation(&self, base: &str, filename: &str, content: &[u8]) {
        self.add_observation_with(base, filename, content, None, 0);
    }

    pub fn add_observation_with(
        &self,
        base: &str,
        filename: &str,
        content: &[u8],
        reported_size: Option<u64>,
        fail_first: u32,
    ) {
        let parsed = ParsedFilename::parse(filename).expect("fixture filename must parse");
        let remote_path = parsed.remote_path(base);
        let (dir, name) = remote_path.rsplit_once('/').unwrap();
        let (hour_dir, bucket) = dir.rsplit_once('/').unwrap();

        let mut dirs = self.dirs.lock().unwrap();
        let hour = dirs.entry(hour_dir.to_string()).or_default();
        if !hour.contains(&bucket.to_string()) {
            hour.push(bucket.to_string());
        }
        dirs.entry(dir.to_string())
            .or_default()
            .push(name.to_string());

        self.files.lock().unwrap().insert(
            remote_path,
            std::sync::Arc::new(FakeFile {
                content: content.to_vec(),
                reported_size,
                fail_first: AtomicU32::new(fail_first),
            }),
        );
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn list_dir(&self, path: &str) -> Result<Vec<String>, RemoteError> {
        self.dirs
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn download(&self, remote_path: &str, local_tmp: &Path) -> Result<Fetched, RemoteError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let file = self
            .files
            .lock()
            .unwrap()
            .get(remote_path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_path.to_string()))?;

        if file.fail_first.load(Ordering::SeqCst) > 0 {
            file.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(RemoteError::Transport(format!(
                "injected failure for {remote_path}"
            )));
        }

        if let Some(parent) = local_tmp.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local_tmp, &file.content)?;
        let digest = format!("{:x}", Sha256::digest(&file.content));
        Ok(Fetched {
            bytes: file.content.len() as u64,
            digest,
            reported_size: file.reported_size.or(Some(file.content.len() as u64)),
        })
    }
}

/// Decoder returning synthetic volumes keyed off the filename; can be
/// told to fail its first N calls.
#[derive(Default)]
pub struct ScriptedDecoder {
    pub fail_first: AtomicU32,
    pub calls: AtomicU32,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_first: AtomicU32::new(n),
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VolumeDecoder for ScriptedDecoder {
    fn decode(&self, file: &Path, _resources: &Path) -> Result<DecodedVolume, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first.load(Ordering::SeqCst) > 0 {
            self.fail_first.fetch_sub(1, Ordering::SeqCst);
            return Err(DecodeError::Rejected {
                path: file.display().to_string(),
                code: -7,
            });
        }

        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let parsed = ParsedFilename::parse(name).map_err(|_| DecodeError::Rejected {
            path: file.display().to_string(),
            code: -8,
        })?;

        let value = match parsed.field.as_str() {
            "DBZH" => 30.0,
            "VRAD" => 5.0,
            _ => 1.0,
        };
        let nsweeps = 2;
        let nrays = 8;
        let ngates = 16;
        Ok(DecodedVolume {
            data: vec![value; nsweeps * nrays * ngates],
            rays: nsweeps * nrays,
            gates: ngates,
            meta: VolumeMeta {
                radar: parsed.radar.clone(),
                field: parsed.field.clone(),
                latitude_deg: -31.44,
                longitude_deg: -64.19,
                altitude_m: 476.0,
                instant: parsed.instant,
            },
            sweeps: (0..nsweeps)
                .map(|i| SweepMeta {
                    nrays,
                    ngates,
                    gate_size_m: 300.0,
                    gate_offset_m: 0.0,
                    start_time: parsed.instant + chrono::Duration::seconds(20 * i as i64),
                    end_time: parsed.instant + chrono::Duration::seconds(20 * i as i64 + 15),
                    fixed_angle_deg: 0.5 + i as f32,
                    prt_s: Some(1e-3),
                    pulse_width_s: Some(1e-6),
                    nyquist_mps: Some(13.25),
                    scan_rate_dps: Some(18.0),
                })
                .collect(),
        })
    }
}

/// Settings tuned for fast, deterministic tests under a temp directory.
pub fn test_settings(root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.connection.host = "test.invalid".into();
    settings.connection.base_path = "/L2".into();
    settings.radar.name = "RMA1".into();
    settings.radar.extension = "BUFR".into();
    settings.window.start_instant = Some(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap());
    settings.window.end_instant = Some(Utc.with_ymd_and_hms(2025, 1, 1, 13, 0, 0).unwrap());
    settings
        .volumes
        .entry("0315".into())
        .or_default()
        .insert("01".into(), vec!["DBZH".into(), "VRAD".into()]);
    settings.directories.raw_root = root.join("raw");
    settings.directories.container_root = root.join("volumes");
    settings.directories.product_root = root.join("products");
    settings.directories.decoder_resources = root.join("resources");
    settings.directories.state_db = root.join("state.db");
    settings.tuning.download_base_delay_ms = 1;
    settings.tuning.download_max_delay_ms = 2;
    settings.tuning.decode_base_delay_ms = 1;
    settings.tuning.decode_max_delay_ms = 2;
    settings.tuning.poll_interval_secs = 1;
    settings.renderer.image_size = 64;
    settings.renderer.fields = vec!["DBZH".into(), "VRAD".into()];
    settings.validate().expect("test settings must validate");
    settings
}
