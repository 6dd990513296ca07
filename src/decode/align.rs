//! Alignment of heterogeneous sub-products onto a common range grid.
//!
//! Different field files of the same volume may carry different gate
//! counts and range offsets. The field whose outermost gate reaches the
//! farthest becomes the reference; every other field is placed into the
//! reference grid at its own start offset, with NaN padding for the gates
//! it does not cover. Geometry that cannot be reconciled fails the whole
//! volume rather than producing silently shifted data.

use tracing::debug;

use super::ffi::{DecodedVolume, SweepMeta};
use crate::error::{PipelineError, PipelineResult};

/// Range grid shared by all aligned fields.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSpec {
    pub gate_offset_m: f64,
    pub gate_size_m: f64,
    pub ngates: usize,
}

/// One field re-gridded onto the reference grid.
#[derive(Debug, Clone)]
pub struct AlignedField {
    pub name: String,
    /// Row-major `rays x grid.ngates`.
    pub data: Vec<f32>,
}

/// All fields of one volume on a single grid, plus the sweep structure
/// (taken from the reference field, validated against every other).
#[derive(Debug)]
pub struct AlignedSet {
    pub grid: GridSpec,
    pub rays: usize,
    pub sweeps: Vec<SweepMeta>,
    pub fields: Vec<AlignedField>,
    /// Index into the original `decoded` slice of the reference field.
    pub reference: usize,
}

/// Align every decoded field onto the grid of the farthest-reaching one.
pub fn align_fields(decoded: &[DecodedVolume]) -> PipelineResult<AlignedSet> {
    if decoded.is_empty() {
        return Err(PipelineError::Geometry("no decoded fields".to_string()));
    }

    check_cross_field_consistency(decoded)?;

    let reference = decoded
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.max_range_m()
                .partial_cmp(&b.max_range_m())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0);
    let ref_field = &decoded[reference];
    let grid = GridSpec {
        gate_offset_m: ref_field.sweeps[0].gate_offset_m,
        gate_size_m: ref_field.sweeps[0].gate_size_m,
        ngates: ref_field.gates,
    };
    debug!(
        reference = %ref_field.meta.field,
        ngates = grid.ngates,
        gate_size_m = grid.gate_size_m,
        "Selected reference grid"
    );

    let mut fields = Vec::with_capacity(decoded.len());
    for volume in decoded {
        fields.push(align_one(volume, &grid, ref_field.rays)?);
    }

    Ok(AlignedSet {
        grid,
        rays: ref_field.rays,
        sweeps: ref_field.sweeps.clone(),
        fields,
        reference,
    })
}

/// Sweep-structure checks across fields: same sweep count, same ray count
/// per sweep, same gate size, uniform geometry within each file.
fn check_cross_field_consistency(decoded: &[DecodedVolume]) -> PipelineResult<()> {
    let first = &decoded[0];
    for volume in decoded {
        if volume.sweeps.is_empty() {
            return Err(PipelineError::Geometry(format!(
                "field {} has no sweeps",
                volume.meta.field
            )));
        }
        let s0 = &volume.sweeps[0];
        for sweep in &volume.sweeps {
            if sweep.gate_size_m != s0.gate_size_m || sweep.gate_offset_m != s0.gate_offset_m {
                return Err(PipelineError::Geometry(format!(
                    "field {} mixes gate geometries across sweeps",
                    volume.meta.field
                )));
            }
        }
        if volume.sweeps.len() != first.sweeps.len() {
            return Err(PipelineError::Geometry(format!(
                "sweep count differs: {} has {}, {} has {}",
                first.meta.field,
                first.sweeps.len(),
                volume.meta.field,
                volume.sweeps.len()
            )));
        }
        for (a, b) in first.sweeps.iter().zip(volume.sweeps.iter()) {
            if a.nrays != b.nrays {
                return Err(PipelineError::Geometry(format!(
                    "ray count differs between {} ({}) and {} ({})",
                    first.meta.field, a.nrays, volume.meta.field, b.nrays
                )));
            }
        }
        if volume.sweeps[0].gate_size_m != first.sweeps[0].gate_size_m {
            return Err(PipelineError::Geometry(format!(
                "gate size differs between {} and {}",
                first.meta.field, volume.meta.field
            )));
        }
    }
    Ok(())
}

/// Place one field's data into the reference grid.
fn align_one(volume: &DecodedVolume, grid: &GridSpec, rays: usize) -> PipelineResult<AlignedField> {
    if volume.rays != rays {
        return Err(PipelineError::Geometry(format!(
            "field {} has {} rays, reference has {rays}",
            volume.meta.field, volume.rays
        )));
    }

    let offset_diff = volume.sweeps[0].gate_offset_m - grid.gate_offset_m;
    let start = offset_diff / grid.gate_size_m;
    if start < 0.0 || start.fract().abs() > 1e-6 {
        return Err(PipelineError::Geometry(format!(
            "field {} offset {} m not representable on reference grid",
            volume.meta.field, volume.sweeps[0].gate_offset_m
        )));
    }
    let start = start as usize;
    if start + volume.gates > grid.ngates {
        // reference was chosen for maximum reach; a field poking past it
        // means the sweep geometry is inconsistent
        return Err(PipelineError::Geometry(format!(
            "field {} exceeds reference grid ({} + {} > {})",
            volume.meta.field, start, volume.gates, grid.ngates
        )));
    }

    let mut data = vec![f32::NAN; rays * grid.ngates];
    for ray in 0..rays {
        let src = &volume.data[ray * volume.gates..(ray + 1) * volume.gates];
        let dst = &mut data[ray * grid.ngates + start..ray * grid.ngates + start + volume.gates];
        dst.copy_from_slice(src);
    }

    Ok(AlignedField {
        name: volume.meta.field.clone(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ffi::{SweepMeta, VolumeMeta};
    use chrono::{TimeZone, Utc};

    fn sweep(nrays: usize, ngates: usize, gate_size: f64, offset: f64, angle: f32) -> SweepMeta {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        SweepMeta {
            nrays,
            ngates,
            gate_size_m: gate_size,
            gate_offset_m: offset,
            start_time: t0,
            end_time: t0 + chrono::Duration::seconds(10),
            fixed_angle_deg: angle,
            prt_s: Some(1e-3),
            pulse_width_s: Some(1e-6),
            nyquist_mps: Some(13.2),
            scan_rate_dps: Some(18.0),
        }
    }

    fn volume(field: &str, nsweeps: usize, nrays: usize, ngates: usize, offset: f64) -> DecodedVolume {
        let rays = nsweeps * nrays;
        DecodedVolume {
            data: (0..rays * ngates).map(|i| i as f32).collect(),
            rays,
            gates: ngates,
            meta: VolumeMeta {
                radar: "RMA1".into(),
                field: field.into(),
                latitude_deg: -31.44,
                longitude_deg: -64.19,
                altitude_m: 476.0,
                instant: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            },
            sweeps: (0..nsweeps)
                .map(|i| sweep(nrays, ngates, 300.0, offset, i as f32))
                .collect(),
        }
    }

    #[test]
    fn reference_is_longest_reach() {
        let short = volume("VRAD", 2, 360, 500, 0.0);
        let long = volume("DBZH", 2, 360, 1000, 0.0);
        let aligned = align_fields(&[short, long]).unwrap();
        assert_eq!(aligned.reference, 1);
        assert_eq!(aligned.grid.ngates, 1000);
    }

    #[test]
    fn shorter_field_is_right_padded_with_nan() {
        let short = volume("VRAD", 1, 4, 3, 0.0);
        let long = volume("DBZH", 1, 4, 6, 0.0);
        let aligned = align_fields(&[short, long]).unwrap();

        let vrad = aligned.fields.iter().find(|f| f.name == "VRAD").unwrap();
        // first ray: 3 real gates then padding
        assert_eq!(vrad.data[0], 0.0);
        assert_eq!(vrad.data[2], 2.0);
        assert!(vrad.data[3].is_nan());
        assert!(vrad.data[5].is_nan());
        // second ray starts at grid stride 6
        assert_eq!(vrad.data[6], 3.0);
    }

    #[test]
    fn offset_field_is_shifted_into_place() {
        let offset = volume("KDP", 1, 2, 4, 600.0); // starts 2 gates in
        let reference = volume("DBZH", 1, 2, 8, 0.0);
        let aligned = align_fields(&[offset, reference]).unwrap();

        let kdp = aligned.fields.iter().find(|f| f.name == "KDP").unwrap();
        assert!(kdp.data[0].is_nan());
        assert!(kdp.data[1].is_nan());
        assert_eq!(kdp.data[2], 0.0);
        assert_eq!(kdp.data[5], 3.0);
        assert!(kdp.data[6].is_nan());
    }

    #[test]
    fn sweep_count_mismatch_is_rejected() {
        let a = volume("DBZH", 2, 360, 500, 0.0);
        let b = volume("VRAD", 3, 360, 500, 0.0);
        let err = align_fields(&[a, b]).unwrap_err();
        assert!(matches!(err, PipelineError::Geometry(_)));
    }

    #[test]
    fn ray_count_mismatch_is_rejected() {
        let a = volume("DBZH", 1, 360, 500, 0.0);
        let b = volume("VRAD", 1, 240, 500, 0.0);
        assert!(align_fields(&[a, b]).is_err());
    }

    #[test]
    fn gate_size_mismatch_is_rejected() {
        let a = volume("DBZH", 1, 10, 8, 0.0);
        let mut b = volume("VRAD", 1, 10, 8, 0.0);
        for s in &mut b.sweeps {
            s.gate_size_m = 150.0;
        }
        assert!(align_fields(&[a, b]).is_err());
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let a = volume("DBZH", 1, 4, 8, 0.0);
        let b = volume("VRAD", 1, 4, 4, 450.0); // not a multiple of 300
        assert!(align_fields(&[a, b]).is_err());
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(align_fields(&[]).is_err());
    }
}
