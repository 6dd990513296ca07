//! PPI rasterization to PNG.
//!
//! One sweep of one field is projected onto a north-up cartesian grid by
//! nearest-neighbor lookup: each pixel maps to a (range, azimuth) pair,
//! which picks a (ray, gate) cell. Gates that are missing, outside the
//! scan, or rejected by the quality mask come out transparent.

use anyhow::{anyhow, Context, Result};
use image::{Rgba, RgbaImage};
use std::path::Path;
use tracing::debug;

use crate::decode::radar::RadarVolume;

/// Display scaling for one raster.
#[derive(Debug, Clone, Copy)]
pub struct PlotSpec {
    pub size: u32,
    pub vmin: f32,
    pub vmax: f32,
}

/// Piecewise blue → green → yellow → red ramp over `[0, 1]`.
fn colormap(t: f32) -> Rgba<u8> {
    let t = t.clamp(0.0, 1.0);
    let (r, g, b) = if t < 0.25 {
        let f = t / 0.25;
        (0.0, f, 1.0)
    } else if t < 0.5 {
        let f = (t - 0.25) / 0.25;
        (0.0, 1.0, 1.0 - f)
    } else if t < 0.75 {
        let f = (t - 0.5) / 0.25;
        (f, 1.0, 0.0)
    } else {
        let f = (t - 0.75) / 0.25;
        (1.0, 1.0 - f, 0.0)
    };
    Rgba([(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8, 255])
}

/// Rasterize one sweep of one field.
///
/// `mask` is an optional per-cell keep mask over the whole volume shape;
/// masked gates render transparent.
pub fn rasterize_ppi(
    volume: &RadarVolume,
    field: &str,
    sweep: usize,
    spec: &PlotSpec,
    mask: Option<&[bool]>,
) -> Result<RgbaImage> {
    let layer = volume
        .fields
        .get(field)
        .ok_or_else(|| anyhow!("field '{field}' not in volume"))?;
    if sweep >= volume.nsweeps() {
        return Err(anyhow!("sweep {sweep} out of range"));
    }
    let gates = volume.gates();
    let rays = volume.sweep_rays(sweep);
    let nrays = rays.len();
    let start_ray = rays.start;

    let first_range = *volume.range_m.first().unwrap_or(&0.0);
    let last_range = *volume.range_m.last().unwrap_or(&0.0);
    if last_range <= 0.0 {
        return Err(anyhow!("degenerate range axis"));
    }
    let gate_step = if gates > 1 {
        (last_range - first_range) / (gates - 1) as f32
    } else {
        last_range.max(1.0)
    };

    let size = spec.size;
    let half = size as f32 / 2.0;
    let scale = last_range / half;
    let span = (spec.vmax - spec.vmin).max(f32::EPSILON);

    let mut img = RgbaImage::from_pixel(size, size, Rgba([0, 0, 0, 0]));
    for py in 0..size {
        for px in 0..size {
            let dx = (px as f32 + 0.5 - half) * scale;
            let dy = (half - (py as f32 + 0.5)) * scale;
            let r = (dx * dx + dy * dy).sqrt();
            if r < first_range || r > last_range {
                continue;
            }
            // clockwise azimuth with 0 at north
            let az = dx.atan2(dy).to_degrees().rem_euclid(360.0);
            let ray = ((az / 360.0 * nrays as f32) as usize).min(nrays - 1);
            let gate = (((r - first_range) / gate_step).round() as usize).min(gates - 1);

            let idx = (start_ray + ray) * gates + gate;
            if let Some(mask) = mask {
                if !mask[idx] {
                    continue;
                }
            }
            let value = layer.data[idx];
            if !value.is_finite() {
                continue;
            }
            let t = (value - spec.vmin) / span;
            img.put_pixel(px, py, colormap(t));
        }
    }
    debug!(field, sweep, size, "Rasterized sweep");
    Ok(img)
}

/// Save a raster, creating the date-bucketed directory tree on demand.
pub fn save_png(img: &RgbaImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    img.save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::align::align_fields;
    use crate::decode::ffi::{DecodedVolume, SweepMeta, VolumeMeta};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn uniform_volume(value: f32) -> RadarVolume {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let nrays = 36;
        let ngates = 20;
        let decoded = DecodedVolume {
            data: vec![value; nrays * ngates],
            rays: nrays,
            gates: ngates,
            meta: VolumeMeta {
                radar: "RMA1".into(),
                field: "DBZH".into(),
                latitude_deg: 0.0,
                longitude_deg: 0.0,
                altitude_m: 0.0,
                instant: t0,
            },
            sweeps: vec![SweepMeta {
                nrays,
                ngates,
                gate_size_m: 300.0,
                gate_offset_m: 0.0,
                start_time: t0,
                end_time: t0 + chrono::Duration::seconds(10),
                fixed_angle_deg: 0.5,
                prt_s: None,
                pulse_width_s: None,
                nyquist_mps: None,
                scan_rate_dps: None,
            }],
        };
        let meta = decoded.meta.clone();
        let aligned = align_fields(&[decoded]).unwrap();
        RadarVolume::from_aligned(aligned, &meta).unwrap()
    }

    fn spec() -> PlotSpec {
        PlotSpec {
            size: 64,
            vmin: -20.0,
            vmax: 70.0,
        }
    }

    #[test]
    fn uniform_field_paints_inside_scan_circle() {
        let vol = uniform_volume(35.0);
        let img = rasterize_ppi(&vol, "DBZH", 0, &spec(), None).unwrap();
        // a pixel halfway out on the +x axis is inside the scan
        let p = img.get_pixel(48, 32);
        assert_eq!(p.0[3], 255, "expected opaque pixel, got {:?}", p);
        // corners are outside the circle and stay transparent
        assert_eq!(img.get_pixel(0, 0).0[3], 0);
    }

    #[test]
    fn nan_gates_are_transparent() {
        let vol = uniform_volume(f32::NAN);
        let img = rasterize_ppi(&vol, "DBZH", 0, &spec(), None).unwrap();
        assert!(img.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn mask_blanks_cells() {
        let vol = uniform_volume(35.0);
        let mask = vec![false; vol.rays() * vol.gates()];
        let img = rasterize_ppi(&vol, "DBZH", 0, &spec(), Some(&mask)).unwrap();
        assert!(img.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn missing_field_is_an_error() {
        let vol = uniform_volume(1.0);
        assert!(rasterize_ppi(&vol, "KDP", 0, &spec(), None).is_err());
    }

    #[test]
    fn png_lands_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("RMA1/2025/01/01/plot.png");
        let vol = uniform_volume(10.0);
        let img = rasterize_ppi(&vol, "DBZH", 0, &spec(), None).unwrap();
        save_png(&img, &path).unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
