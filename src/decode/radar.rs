//! Canonical in-memory radar volume.
//!
//! One logical structure per scan: a shared range axis, per-ray azimuth,
//! elevation and time coordinates, sweep boundary indices, instrument
//! parameters when the metadata supplies them, and one field layer per
//! aligned sub-product. The constructor enforces the shape invariants so
//! everything downstream (writer, renderer) can index without checking.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Range;

use super::align::AlignedSet;
use super::ffi::VolumeMeta;
use crate::error::{PipelineError, PipelineResult};

/// Units attached to well-known field names in the output container.
pub fn units_for_field(name: &str) -> Option<&'static str> {
    match name {
        "DBZH" | "DBZV" | "TH" | "TV" | "COLMAX" => Some("dBZ"),
        "ZDR" => Some("dB"),
        "KDP" => Some("deg/km"),
        "PHIDP" => Some("deg"),
        "VRAD" | "WRAD" => Some("m/s"),
        "RHOHV" => Some("1"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct FieldLayer {
    /// Row-major `rays x gates`; NaN marks missing gates.
    pub data: Vec<f32>,
    pub units: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstrumentParameters {
    pub nyquist_mps: Option<f64>,
    pub prt_s: Option<f64>,
    pub pulse_width_s: Option<f64>,
}

impl InstrumentParameters {
    pub fn is_empty(&self) -> bool {
        self.nyquist_mps.is_none() && self.prt_s.is_none() && self.pulse_width_s.is_none()
    }
}

/// Canonical radar volume.
#[derive(Debug, Clone)]
pub struct RadarVolume {
    pub radar: String,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
    /// Observation instant of the volume (start of the first sweep group).
    pub instant: DateTime<Utc>,
    /// Gate center distances, meters.
    pub range_m: Vec<f32>,
    pub azimuth_deg: Vec<f32>,
    pub elevation_deg: Vec<f32>,
    /// Per-ray offset from `instant`, seconds.
    pub time_offset_s: Vec<f64>,
    pub sweep_start_ray_index: Vec<usize>,
    pub sweep_end_ray_index: Vec<usize>,
    pub fixed_angle_deg: Vec<f32>,
    pub instrument: Option<InstrumentParameters>,
    pub fields: BTreeMap<String, FieldLayer>,
}

impl RadarVolume {
    /// Build the canonical object from aligned sub-products. `meta` is the
    /// volume metadata of the reference field.
    pub fn from_aligned(aligned: AlignedSet, meta: &VolumeMeta) -> PipelineResult<Self> {
        let instant = meta.instant;
        let grid = &aligned.grid;
        let reference_meta = &aligned.sweeps;

        let range_m: Vec<f32> = (0..grid.ngates)
            .map(|i| (grid.gate_offset_m + grid.gate_size_m * i as f64) as f32)
            .collect();

        let mut azimuth_deg = Vec::with_capacity(aligned.rays);
        let mut elevation_deg = Vec::with_capacity(aligned.rays);
        let mut time_offset_s = Vec::with_capacity(aligned.rays);
        let mut sweep_start = Vec::with_capacity(reference_meta.len());
        let mut sweep_end = Vec::with_capacity(reference_meta.len());
        let mut fixed_angle = Vec::with_capacity(reference_meta.len());

        let mut ray0 = 0usize;
        for sweep in reference_meta {
            sweep_start.push(ray0);
            sweep_end.push(ray0 + sweep.nrays - 1);
            fixed_angle.push(sweep.fixed_angle_deg);

            let duration = (sweep.end_time - sweep.start_time)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            let base = (sweep.start_time - instant).num_milliseconds() as f64 / 1000.0;
            for i in 0..sweep.nrays {
                azimuth_deg.push(360.0 * i as f32 / sweep.nrays as f32);
                elevation_deg.push(sweep.fixed_angle_deg);
                let frac = if sweep.nrays > 1 {
                    i as f64 / (sweep.nrays - 1) as f64
                } else {
                    0.0
                };
                time_offset_s.push(base + frac * duration);
            }
            ray0 += sweep.nrays;
        }

        let instrument = {
            let params = InstrumentParameters {
                nyquist_mps: reference_meta[0].nyquist_mps,
                prt_s: reference_meta[0].prt_s,
                pulse_width_s: reference_meta[0].pulse_width_s,
            };
            (!params.is_empty()).then_some(params)
        };

        let mut fields = BTreeMap::new();
        for field in aligned.fields {
            let units = units_for_field(&field.name).map(|u| u.to_string());
            fields.insert(
                field.name.clone(),
                FieldLayer {
                    data: field.data,
                    units,
                },
            );
        }

        let volume = Self {
            radar: meta.radar.clone(),
            latitude_deg: meta.latitude_deg,
            longitude_deg: meta.longitude_deg,
            altitude_m: meta.altitude_m,
            instant,
            range_m,
            azimuth_deg,
            elevation_deg,
            time_offset_s,
            sweep_start_ray_index: sweep_start,
            sweep_end_ray_index: sweep_end,
            fixed_angle_deg: fixed_angle,
            instrument,
            fields,
        };
        volume.validate()?;
        Ok(volume)
    }

    pub fn rays(&self) -> usize {
        self.azimuth_deg.len()
    }

    pub fn gates(&self) -> usize {
        self.range_m.len()
    }

    pub fn nsweeps(&self) -> usize {
        self.fixed_angle_deg.len()
    }

    /// Ray index range of one sweep.
    pub fn sweep_rays(&self, sweep: usize) -> Range<usize> {
        self.sweep_start_ray_index[sweep]..self.sweep_end_ray_index[sweep] + 1
    }

    /// Sweep index with the lowest fixed angle.
    pub fn lowest_sweep(&self) -> usize {
        self.fixed_angle_deg
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Insert a field layer, enforcing the shared shape.
    pub fn add_field(&mut self, name: &str, layer: FieldLayer) -> PipelineResult<()> {
        if layer.data.len() != self.rays() * self.gates() {
            return Err(PipelineError::Geometry(format!(
                "field {name} has {} cells, volume shape is {}x{}",
                layer.data.len(),
                self.rays(),
                self.gates()
            )));
        }
        self.fields.insert(name.to_string(), layer);
        Ok(())
    }

    /// Invariants: every layer matches the `(rays, gates)` shape, sweep
    /// boundaries are monotonic and contiguous, per-ray times are
    /// non-decreasing within each sweep.
    pub fn validate(&self) -> PipelineResult<()> {
        let rays = self.rays();
        let gates = self.gates();
        if rays == 0 || gates == 0 {
            return Err(PipelineError::Geometry("empty volume".to_string()));
        }
        if self.elevation_deg.len() != rays || self.time_offset_s.len() != rays {
            return Err(PipelineError::Geometry(
                "per-ray axes disagree on ray count".to_string(),
            ));
        }
        if self.sweep_start_ray_index.len() != self.sweep_end_ray_index.len()
            || self.sweep_start_ray_index.len() != self.fixed_angle_deg.len()
            || self.sweep_start_ray_index.is_empty()
        {
            return Err(PipelineError::Geometry(
                "sweep boundary arrays inconsistent".to_string(),
            ));
        }

        let mut expected_start = 0usize;
        for (i, (&start, &end)) in self
            .sweep_start_ray_index
            .iter()
            .zip(&self.sweep_end_ray_index)
            .enumerate()
        {
            if start != expected_start || end < start || end >= rays {
                return Err(PipelineError::Geometry(format!(
                    "sweep {i} boundaries not monotonic ({start}..={end})"
                )));
            }
            let times = &self.time_offset_s[start..=end];
            if times.windows(2).any(|w| w[1] < w[0]) {
                return Err(PipelineError::Geometry(format!(
                    "ray times decrease within sweep {i}"
                )));
            }
            expected_start = end + 1;
        }
        if expected_start != rays {
            return Err(PipelineError::Geometry(
                "sweeps do not cover all rays".to_string(),
            ));
        }

        for (name, layer) in &self.fields {
            if layer.data.len() != rays * gates {
                return Err(PipelineError::Geometry(format!(
                    "field {name} shape mismatch"
                )));
            }
        }
        Ok(())
    }

    /// Value at `(ray, gate)` for a field; NaN when missing.
    pub fn value(&self, field: &str, ray: usize, gate: usize) -> f32 {
        self.fields
            .get(field)
            .and_then(|l| l.data.get(ray * self.gates() + gate))
            .copied()
            .unwrap_or(f32::NAN)
    }
}
