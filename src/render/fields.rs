//! Field standardization, quality-control masks, and derived fields.
//!
//! Containers written from different decoder versions may carry aliased
//! field names; the renderer normalizes them to the canonical set before
//! plotting. The column-maximum derived field compresses all sweeps above
//! a minimum elevation into one plane, optionally masking gates that fail
//! the polarimetric quality thresholds.

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::decode::radar::{FieldLayer, RadarVolume};

/// Aliases occasionally seen in upstream products, mapped to the
/// canonical field names.
fn canonical_name(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        "V" | "VEL" => "VRAD".to_string(),
        "W" => "WRAD".to_string(),
        "DBZ" | "REFL" => "DBZH".to_string(),
        "RHV" => "RHOHV".to_string(),
        "PDP" => "PHIDP".to_string(),
        _ => upper,
    }
}

/// Normalize every field name to the canonical set.
pub fn standardize_field_names(volume: &mut RadarVolume) -> Result<()> {
    let names: Vec<String> = volume.fields.keys().cloned().collect();
    for name in names {
        let canonical = canonical_name(&name);
        if canonical == name {
            continue;
        }
        if volume.fields.contains_key(&canonical) {
            return Err(anyhow!(
                "field '{name}' standardizes to '{canonical}', which already exists"
            ));
        }
        if let Some(layer) = volume.fields.remove(&name) {
            debug!(from = %name, to = %canonical, "Standardized field name");
            volume.fields.insert(canonical, layer);
        }
    }
    Ok(())
}

/// Chosen reflectivity fields: corrected name preferred, raw fallback.
#[derive(Debug, Clone, Default)]
pub struct ReflectivitySelection {
    pub horizontal: Option<String>,
    pub vertical: Option<String>,
}

/// Pick the horizontal and vertical reflectivity fields present in the
/// volume; `DBZH`/`DBZV` win over the raw `TH`/`TV` variants.
pub fn determine_reflectivity(volume: &RadarVolume) -> ReflectivitySelection {
    let pick = |corrected: &str, raw: &str| -> Option<String> {
        if volume.fields.contains_key(corrected) {
            Some(corrected.to_string())
        } else if volume.fields.contains_key(raw) {
            Some(raw.to_string())
        } else {
            None
        }
    };
    ReflectivitySelection {
        horizontal: pick("DBZH", "TH"),
        vertical: pick("DBZV", "TV"),
    }
}

/// Quality-control thresholds for the filtered product variant.
#[derive(Debug, Clone, Copy)]
pub struct QcThresholds {
    pub rhohv_min: f32,
    pub wrad_max: f32,
    pub zdr_max: f32,
}

/// Per-cell keep mask; a gate is dropped when any present QC field fails
/// its threshold. Fields absent from the volume do not filter anything.
pub fn qc_mask(volume: &RadarVolume, thresholds: &QcThresholds) -> Vec<bool> {
    let cells = volume.rays() * volume.gates();
    let mut keep = vec![true; cells];

    if let Some(rhohv) = volume.fields.get("RHOHV") {
        for (k, &v) in keep.iter_mut().zip(&rhohv.data) {
            if v.is_finite() && v < thresholds.rhohv_min {
                *k = false;
            }
        }
    }
    if let Some(wrad) = volume.fields.get("WRAD") {
        for (k, &v) in keep.iter_mut().zip(&wrad.data) {
            if v.is_finite() && v > thresholds.wrad_max {
                *k = false;
            }
        }
    }
    if let Some(zdr) = volume.fields.get("ZDR") {
        for (k, &v) in keep.iter_mut().zip(&zdr.data) {
            if v.is_finite() && v > thresholds.zdr_max {
                *k = false;
            }
        }
    }
    keep
}

/// Name of the derived column-maximum field.
pub const COLMAX_FIELD: &str = "COLMAX";

/// Add the vertical-maximum reflectivity field.
///
/// For every (ray-within-sweep, gate) cell the maximum of `source` across
/// all sweeps with fixed angle at or above `elev_limit` is taken, with QC
/// masking applied per contributing cell. The resulting plane is
/// replicated into every sweep block so the layer keeps the volume shape.
pub fn add_column_max(
    volume: &mut RadarVolume,
    source: &str,
    elev_limit: f32,
    thresholds: &QcThresholds,
) -> Result<()> {
    let layer = volume
        .fields
        .get(source)
        .ok_or_else(|| anyhow!("column-max source field '{source}' not present"))?;
    let gates = volume.gates();
    let nsweeps = volume.nsweeps();

    let rays_per_sweep = volume.sweep_rays(0).len();
    for sweep in 0..nsweeps {
        if volume.sweep_rays(sweep).len() != rays_per_sweep {
            return Err(anyhow!("sweeps have differing ray counts"));
        }
    }

    let mut contributing: Vec<usize> = (0..nsweeps)
        .filter(|&s| volume.fixed_angle_deg[s] >= elev_limit)
        .collect();
    if contributing.is_empty() {
        contributing = (0..nsweeps).collect();
    }

    let keep = qc_mask(volume, thresholds);
    let mut plane = vec![f32::NAN; rays_per_sweep * gates];
    for &sweep in &contributing {
        let start_ray = volume.sweep_start_ray_index[sweep];
        for ray in 0..rays_per_sweep {
            for gate in 0..gates {
                let idx = (start_ray + ray) * gates + gate;
                if !keep[idx] {
                    continue;
                }
                let v = layer.data[idx];
                if !v.is_finite() {
                    continue;
                }
                let out = &mut plane[ray * gates + gate];
                if out.is_nan() || v > *out {
                    *out = v;
                }
            }
        }
    }

    let mut data = Vec::with_capacity(volume.rays() * gates);
    for _ in 0..nsweeps {
        data.extend_from_slice(&plane);
    }
    volume.add_field(
        COLMAX_FIELD,
        FieldLayer {
            data,
            units: Some("dBZ".to_string()),
        },
    )?;
    debug!(
        source,
        sweeps = contributing.len(),
        "Added column-maximum field"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::align::align_fields;
    use crate::decode::ffi::{DecodedVolume, SweepMeta, VolumeMeta};
    use chrono::{TimeZone, Utc};

    fn volume_with(fields: &[(&str, Vec<f32>)], nsweeps: usize, nrays: usize, ngates: usize) -> RadarVolume {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let decoded: Vec<DecodedVolume> = fields
            .iter()
            .map(|(name, data)| DecodedVolume {
                data: data.clone(),
                rays: nsweeps * nrays,
                gates: ngates,
                meta: VolumeMeta {
                    radar: "RMA1".into(),
                    field: name.to_string(),
                    latitude_deg: 0.0,
                    longitude_deg: 0.0,
                    altitude_m: 0.0,
                    instant: t0,
                },
                sweeps: (0..nsweeps)
                    .map(|i| SweepMeta {
                        nrays,
                        ngates,
                        gate_size_m: 300.0,
                        gate_offset_m: 0.0,
                        start_time: t0,
                        end_time: t0 + chrono::Duration::seconds(10),
                        fixed_angle_deg: 0.5 + i as f32,
                        prt_s: None,
                        pulse_width_s: None,
                        nyquist_mps: None,
                        scan_rate_dps: None,
                    })
                    .collect(),
            })
            .collect();
        let aligned = align_fields(&decoded).unwrap();
        let meta = decoded[aligned.reference].meta.clone();
        RadarVolume::from_aligned(aligned, &meta).unwrap()
    }

    #[test]
    fn aliases_are_standardized() {
        let cells = 2 * 3;
        let mut vol = volume_with(&[("vel", vec![1.0; cells])], 1, 2, 3);
        standardize_field_names(&mut vol).unwrap();
        assert!(vol.fields.contains_key("VRAD"));
        assert!(!vol.fields.contains_key("vel"));
    }

    #[test]
    fn alias_collision_is_an_error() {
        let cells = 2 * 3;
        let mut vol = volume_with(
            &[("VRAD", vec![1.0; cells]), ("vel", vec![2.0; cells])],
            1,
            2,
            3,
        );
        assert!(standardize_field_names(&mut vol).is_err());
    }

    #[test]
    fn reflectivity_prefers_corrected_fields() {
        let cells = 2 * 3;
        let vol = volume_with(
            &[("DBZH", vec![1.0; cells]), ("TH", vec![2.0; cells])],
            1,
            2,
            3,
        );
        let sel = determine_reflectivity(&vol);
        assert_eq!(sel.horizontal.as_deref(), Some("DBZH"));
        assert_eq!(sel.vertical, None);
    }

    #[test]
    fn qc_mask_drops_low_rhohv() {
        let cells = 2 * 2;
        let vol = volume_with(
            &[
                ("DBZH", vec![10.0; cells]),
                ("RHOHV", vec![0.95, 0.5, 0.9, f32::NAN]),
            ],
            1,
            2,
            2,
        );
        let mask = qc_mask(
            &vol,
            &QcThresholds {
                rhohv_min: 0.8,
                wrad_max: 4.6,
                zdr_max: 8.5,
            },
        );
        assert_eq!(mask, vec![true, false, true, true]);
    }

    #[test]
    fn column_max_takes_maximum_over_sweeps() {
        // 2 sweeps, 1 ray per sweep, 2 gates; second sweep has larger values
        let data = vec![10.0, f32::NAN, 30.0, 20.0];
        let mut vol = volume_with(&[("DBZH", data)], 2, 1, 2);
        add_column_max(
            &mut vol,
            "DBZH",
            0.0,
            &QcThresholds {
                rhohv_min: 0.8,
                wrad_max: 4.6,
                zdr_max: 8.5,
            },
        )
        .unwrap();
        let colmax = &vol.fields[COLMAX_FIELD];
        // plane replicated into both sweep blocks
        assert_eq!(colmax.data.len(), 4);
        assert_eq!(colmax.data[0], 30.0);
        assert_eq!(colmax.data[1], 20.0);
        assert_eq!(colmax.data[2], 30.0);
    }

    #[test]
    fn column_max_respects_elevation_limit() {
        // sweep angles are 0.5 and 1.5; only the upper one clears the limit
        let data = vec![10.0, 20.0];
        let mut vol = volume_with(&[("DBZH", data)], 2, 1, 1);
        add_column_max(
            &mut vol,
            "DBZH",
            1.0,
            &QcThresholds {
                rhohv_min: 0.8,
                wrad_max: 4.6,
                zdr_max: 8.5,
            },
        )
        .unwrap();
        // only the 1.5 degree sweep contributes
        assert_eq!(vol.fields[COLMAX_FIELD].data[0], 20.0);
    }

    #[test]
    fn column_max_requires_source_field() {
        let cells = 2;
        let mut vol = volume_with(&[("VRAD", vec![1.0; cells])], 1, 1, 2);
        assert!(add_column_max(
            &mut vol,
            "DBZH",
            0.0,
            &QcThresholds {
                rhohv_min: 0.8,
                wrad_max: 4.6,
                zdr_max: 8.5,
            },
        )
        .is_err());
    }
}
