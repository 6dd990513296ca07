//! Typed adapter over the legacy native observation decoder.
//!
//! The decoder is a pre-built shared library with a C ABI; this module is
//! the only place that touches it. Everything downstream depends on the
//! [`VolumeDecoder`] trait and the owned [`DecodedVolume`] value, never on
//! the library itself, so tests substitute a scripted decoder.
//!
//! The library keeps global state and is not thread-safe: every call goes
//! through a process-wide mutex, and callers are expected to invoke
//! `decode` from a blocking thread.

use chrono::{DateTime, Utc};
use libloading::Library;
use std::ffi::{c_char, c_int, CString};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use tracing::{debug, info};

/// Sentinel the native library uses for missing gates; mapped to NaN on
/// the way out so downstream code can mask with `is_nan`.
const RAW_MISSING: f32 = -9999.0;

#[derive(Error, Debug, Clone)]
pub enum DecodeError {
    /// The shared library could not be loaded or is missing symbols.
    #[error("decoder library unavailable: {0}")]
    Library(String),
    /// The decoder returned a nonzero status for this file. Known to
    /// happen sporadically on valid inputs; callers retry with backoff.
    #[error("decoder rejected '{path}' with code {code}")]
    Rejected { path: String, code: i32 },
    /// The decoder produced output that contradicts itself.
    #[error("decoder output inconsistent: {0}")]
    Inconsistent(String),
}

/// Per-sweep metadata table row.
#[derive(Debug, Clone)]
pub struct SweepMeta {
    pub nrays: usize,
    pub ngates: usize,
    pub gate_size_m: f64,
    pub gate_offset_m: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub fixed_angle_deg: f32,
    pub prt_s: Option<f64>,
    pub pulse_width_s: Option<f64>,
    pub nyquist_mps: Option<f64>,
    pub scan_rate_dps: Option<f64>,
}

/// Volume-level metadata.
#[derive(Debug, Clone)]
pub struct VolumeMeta {
    pub radar: String,
    pub field: String,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
    pub instant: DateTime<Utc>,
}

/// One decoded sub-product: a dense `rays x gates` matrix plus metadata.
#[derive(Debug, Clone)]
pub struct DecodedVolume {
    /// Row-major `rays x gates`; missing gates are NaN.
    pub data: Vec<f32>,
    pub rays: usize,
    pub gates: usize,
    pub meta: VolumeMeta,
    pub sweeps: Vec<SweepMeta>,
}

impl DecodedVolume {
    /// Total reach of the outermost gate, used to pick the reference grid.
    pub fn max_range_m(&self) -> f64 {
        self.sweeps
            .iter()
            .map(|s| s.gate_offset_m + s.gate_size_m * s.ngates as f64)
            .fold(0.0, f64::max)
    }
}

/// Seam between the converter and the decoder implementation.
pub trait VolumeDecoder: Send + Sync {
    fn decode(&self, file: &Path, resources: &Path) -> Result<DecodedVolume, DecodeError>;
}

// ---------------------------------------------------------------------
// Raw C ABI
// ---------------------------------------------------------------------

#[repr(C)]
struct RawSweep {
    nrays: u32,
    ngates: u32,
    gate_size: f64,
    gate_offset: f64,
    start_time: i64,
    end_time: i64,
    fixed_angle: f32,
    prt: f64,
    pulse_width: f64,
    nyquist: f64,
    scan_rate: f64,
}

#[repr(C)]
struct RawVolume {
    data: *const f32,
    rays: u32,
    gates: u32,
    sweeps: *const RawSweep,
    nsweeps: u32,
    latitude: f64,
    longitude: f64,
    altitude: f64,
    instant: i64,
    radar: [c_char; 16],
    field: [c_char; 16],
}

type DecodeFn = unsafe extern "C" fn(*const c_char, *const c_char, *mut *mut RawVolume) -> c_int;
type FreeFn = unsafe extern "C" fn(*mut RawVolume);

/// Serializes every call into the native library.
static LIBRARY_GUARD: OnceLock<Mutex<()>> = OnceLock::new();

/// Decoder backed by the legacy shared library.
///
/// The library is loaded lazily on the first decode so a missing library
/// degrades into per-volume failures instead of refusing to start the
/// pipeline (the fetch stage stays useful).
pub struct NativeDecoder {
    library_path: PathBuf,
    library: OnceLock<Result<Library, String>>,
}

impl NativeDecoder {
    /// Library filename looked up inside the resources directory unless
    /// overridden via `RADAR_DECODER_LIB`.
    const LIBRARY_NAME: &'static str = "libradardec.so";

    pub fn new(resources_dir: &Path) -> Self {
        let library_path = std::env::var_os("RADAR_DECODER_LIB")
            .map(PathBuf::from)
            .unwrap_or_else(|| resources_dir.join(Self::LIBRARY_NAME));
        Self {
            library_path,
            library: OnceLock::new(),
        }
    }

    fn library(&self) -> Result<&Library, DecodeError> {
        let loaded = self.library.get_or_init(|| {
            // Safety: loading runs arbitrary library initialization; the
            // decoder library is part of the deployment, not user input.
            match unsafe { Library::new(&self.library_path) } {
                Ok(lib) => {
                    info!(path = %self.library_path.display(), "Loaded decoder library");
                    Ok(lib)
                }
                Err(e) => Err(format!("{}: {e}", self.library_path.display())),
            }
        });
        loaded.as_ref().map_err(|e| DecodeError::Library(e.clone()))
    }
}

impl VolumeDecoder for NativeDecoder {
    fn decode(&self, file: &Path, resources: &Path) -> Result<DecodedVolume, DecodeError> {
        let library = self.library()?;
        let guard = LIBRARY_GUARD.get_or_init(|| Mutex::new(()));
        let _serialized = guard.lock().map_err(|_| {
            DecodeError::Library("decoder serialization lock poisoned".to_string())
        })?;

        let c_file = path_to_cstring(file)?;
        let c_resources = path_to_cstring(resources)?;

        // Safety: symbols are looked up against the ABI declared above;
        // the output pointer is only dereferenced on a zero return code
        // and released through the paired free function.
        unsafe {
            let decode: libloading::Symbol<'_, DecodeFn> = library
                .get(b"radar_decode_file\0")
                .map_err(|e| DecodeError::Library(e.to_string()))?;
            let free: libloading::Symbol<'_, FreeFn> = library
                .get(b"radar_free_volume\0")
                .map_err(|e| DecodeError::Library(e.to_string()))?;

            let mut raw: *mut RawVolume = std::ptr::null_mut();
            let code = decode(c_file.as_ptr(), c_resources.as_ptr(), &mut raw);
            if code != 0 || raw.is_null() {
                return Err(DecodeError::Rejected {
                    path: file.display().to_string(),
                    code,
                });
            }

            let result = copy_out(&*raw);
            free(raw);
            let volume = result?;
            debug!(
                file = %file.display(),
                rays = volume.rays,
                gates = volume.gates,
                sweeps = volume.sweeps.len(),
                "Decoded observation file"
            );
            Ok(volume)
        }
    }
}

fn path_to_cstring(path: &Path) -> Result<CString, DecodeError> {
    CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| DecodeError::Library(format!("path contains NUL: {}", path.display())))
}

/// Copy the decoder-owned buffers into owned Rust values, mapping the
/// missing sentinel to NaN and validating counts against the data length.
unsafe fn copy_out(raw: &RawVolume) -> Result<DecodedVolume, DecodeError> {
    let rays = raw.rays as usize;
    let gates = raw.gates as usize;
    let nsweeps = raw.nsweeps as usize;
    if raw.data.is_null() || raw.sweeps.is_null() || rays == 0 || gates == 0 || nsweeps == 0 {
        return Err(DecodeError::Inconsistent(
            "empty volume from decoder".to_string(),
        ));
    }

    let cells = rays
        .checked_mul(gates)
        .ok_or_else(|| DecodeError::Inconsistent("volume size overflow".to_string()))?;
    let data: Vec<f32> = std::slice::from_raw_parts(raw.data, cells)
        .iter()
        .map(|&v| if v <= RAW_MISSING { f32::NAN } else { v })
        .collect();

    let sweeps: Vec<SweepMeta> = std::slice::from_raw_parts(raw.sweeps, nsweeps)
        .iter()
        .map(|s| SweepMeta {
            nrays: s.nrays as usize,
            ngates: s.ngates as usize,
            gate_size_m: s.gate_size,
            gate_offset_m: s.gate_offset,
            start_time: epoch(s.start_time),
            end_time: epoch(s.end_time),
            fixed_angle_deg: s.fixed_angle,
            prt_s: positive(s.prt),
            pulse_width_s: positive(s.pulse_width),
            nyquist_mps: positive(s.nyquist),
            scan_rate_dps: positive(s.scan_rate),
        })
        .collect();

    let total_rays: usize = sweeps.iter().map(|s| s.nrays).sum();
    if total_rays != rays {
        return Err(DecodeError::Inconsistent(format!(
            "sweep table declares {total_rays} rays, volume has {rays}"
        )));
    }

    Ok(DecodedVolume {
        data,
        rays,
        gates,
        meta: VolumeMeta {
            radar: fixed_str(&raw.radar),
            field: fixed_str(&raw.field),
            latitude_deg: raw.latitude,
            longitude_deg: raw.longitude,
            altitude_m: raw.altitude,
            instant: epoch(raw.instant),
        },
        sweeps,
    })
}

fn epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn positive(v: f64) -> Option<f64> {
    (v > 0.0).then_some(v)
}

fn fixed_str(buf: &[c_char; 16]) -> String {
    // NUL-terminated by the library contract; cut at the array boundary
    // when the terminator is missing
    let bytes: Vec<u8> = buf
        .iter()
        .map(|&c| c as u8)
        .take_while(|&c| c != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
