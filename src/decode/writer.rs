//! Self-describing container persistence for canonical radar volumes.
//!
//! One volume is serialized as a single Arrow IPC file: one row per ray,
//! with per-ray coordinate columns and one fixed-size-list column per
//! field layer. Everything that is not per-ray (range axis, sweep
//! boundaries, site coordinates, instrument parameters) travels in the
//! schema metadata as JSON, so the file is readable without this crate.
//!
//! Writes are atomic from the catalogue's point of view: the caller only
//! marks the volume processed after this module has synced the file, and
//! a failed write removes the partial output.

use arrow::array::{Array, ArrayRef, FixedSizeListArray, Float32Array, Float64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::radar::{FieldLayer, InstrumentParameters, RadarVolume};
use crate::error::{PipelineError, PipelineResult};

fn container_err<E: std::fmt::Display>(e: E) -> PipelineError {
    PipelineError::Container(e.to_string())
}

/// Write a volume to `path`, removing the partial file on failure.
pub fn write_container(volume: &RadarVolume, path: &Path) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match write_inner(volume, path) {
        Ok(()) => {
            info!(
                path = %path.display(),
                rays = volume.rays(),
                gates = volume.gates(),
                fields = volume.fields.len(),
                "Wrote volume container"
            );
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(path);
            Err(e)
        }
    }
}

fn write_inner(volume: &RadarVolume, path: &Path) -> PipelineResult<()> {
    let gates = volume.gates() as i32;

    let mut metadata = HashMap::new();
    metadata.insert("convention".to_string(), "polar-volume/1".to_string());
    metadata.insert("radar".to_string(), volume.radar.clone());
    metadata.insert("latitude_deg".to_string(), volume.latitude_deg.to_string());
    metadata.insert("longitude_deg".to_string(), volume.longitude_deg.to_string());
    metadata.insert("altitude_m".to_string(), volume.altitude_m.to_string());
    metadata.insert("instant".to_string(), volume.instant.to_rfc3339());
    metadata.insert("missing_value".to_string(), "NaN".to_string());
    metadata.insert(
        "range_m".to_string(),
        serde_json::to_string(&volume.range_m).map_err(container_err)?,
    );
    metadata.insert(
        "sweep_start_ray_index".to_string(),
        serde_json::to_string(&volume.sweep_start_ray_index).map_err(container_err)?,
    );
    metadata.insert(
        "sweep_end_ray_index".to_string(),
        serde_json::to_string(&volume.sweep_end_ray_index).map_err(container_err)?,
    );
    metadata.insert(
        "fixed_angle_deg".to_string(),
        serde_json::to_string(&volume.fixed_angle_deg).map_err(container_err)?,
    );
    if let Some(params) = &volume.instrument {
        if let Some(v) = params.nyquist_mps {
            metadata.insert("nyquist_mps".to_string(), v.to_string());
        }
        if let Some(v) = params.prt_s {
            metadata.insert("prt_s".to_string(), v.to_string());
        }
        if let Some(v) = params.pulse_width_s {
            metadata.insert("pulse_width_s".to_string(), v.to_string());
        }
    }

    let mut schema_fields = vec![
        Field::new("azimuth", DataType::Float32, false),
        Field::new("elevation", DataType::Float32, false),
        Field::new("time_offset", DataType::Float64, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(Float32Array::from(volume.azimuth_deg.clone())),
        Arc::new(Float32Array::from(volume.elevation_deg.clone())),
        Arc::new(Float64Array::from(volume.time_offset_s.clone())),
    ];

    let item = Arc::new(Field::new("item", DataType::Float32, true));
    for (name, layer) in &volume.fields {
        let mut field_meta = HashMap::new();
        if let Some(units) = &layer.units {
            field_meta.insert("units".to_string(), units.clone());
        }
        schema_fields.push(
            Field::new(name, DataType::FixedSizeList(item.clone(), gates), false)
                .with_metadata(field_meta),
        );
        let values = Float32Array::from(layer.data.clone());
        let list = FixedSizeListArray::try_new(item.clone(), gates, Arc::new(values), None)
            .map_err(container_err)?;
        columns.push(Arc::new(list));
    }

    let schema = Arc::new(Schema::new_with_metadata(schema_fields, metadata));
    let batch = RecordBatch::try_new(schema.clone(), columns).map_err(container_err)?;

    let file = File::create(path)?;
    let mut writer = FileWriter::try_new(BufWriter::new(file), &schema).map_err(container_err)?;
    writer.write(&batch).map_err(container_err)?;
    writer.finish().map_err(container_err)?;
    let buffered = writer.into_inner().map_err(container_err)?;
    let file = buffered.into_inner().map_err(container_err)?;
    file.sync_all()?;
    Ok(())
}

/// Read a container back into a canonical volume.
pub fn read_container(path: &Path) -> PipelineResult<RadarVolume> {
    let file = File::open(path)?;
    let reader = FileReader::try_new(file, None).map_err(container_err)?;
    let schema = reader.schema();
    let metadata = schema.metadata().clone();

    let get = |key: &str| -> PipelineResult<String> {
        metadata
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::Container(format!("missing metadata '{key}'")))
    };
    let parse_f64 = |key: &str| -> PipelineResult<f64> {
        get(key)?.parse().map_err(container_err)
    };

    let range_m: Vec<f32> = serde_json::from_str(&get("range_m")?).map_err(container_err)?;
    let sweep_start: Vec<usize> =
        serde_json::from_str(&get("sweep_start_ray_index")?).map_err(container_err)?;
    let sweep_end: Vec<usize> =
        serde_json::from_str(&get("sweep_end_ray_index")?).map_err(container_err)?;
    let fixed_angle: Vec<f32> =
        serde_json::from_str(&get("fixed_angle_deg")?).map_err(container_err)?;
    let instant = chrono::DateTime::parse_from_rfc3339(&get("instant")?)
        .map_err(container_err)?
        .with_timezone(&chrono::Utc);

    let instrument = {
        let params = InstrumentParameters {
            nyquist_mps: metadata.get("nyquist_mps").and_then(|v| v.parse().ok()),
            prt_s: metadata.get("prt_s").and_then(|v| v.parse().ok()),
            pulse_width_s: metadata.get("pulse_width_s").and_then(|v| v.parse().ok()),
        };
        (!params.is_empty()).then_some(params)
    };

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(container_err)?);
    }
    let batch = batches
        .first()
        .ok_or_else(|| PipelineError::Container("container holds no record batch".to_string()))?;

    let f32_column = |name: &str| -> PipelineResult<Vec<f32>> {
        let col = batch
            .column_by_name(name)
            .ok_or_else(|| PipelineError::Container(format!("missing column '{name}'")))?;
        Ok(col
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| PipelineError::Container(format!("column '{name}' is not f32")))?
            .values()
            .to_vec())
    };
    let azimuth_deg = f32_column("azimuth")?;
    let elevation_deg = f32_column("elevation")?;
    let time_offset_s = batch
        .column_by_name("time_offset")
        .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
        .ok_or_else(|| PipelineError::Container("missing column 'time_offset'".to_string()))?
        .values()
        .to_vec();

    let mut fields = BTreeMap::new();
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let DataType::FixedSizeList(_, _) = field.data_type() else {
            continue;
        };
        let list = column
            .as_any()
            .downcast_ref::<FixedSizeListArray>()
            .ok_or_else(|| {
                PipelineError::Container(format!("field column '{}' malformed", field.name()))
            })?;
        let values = list
            .values()
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| {
                PipelineError::Container(format!("field column '{}' is not f32", field.name()))
            })?;
        fields.insert(
            field.name().to_string(),
            FieldLayer {
                data: values.values().to_vec(),
                units: field.metadata().get("units").cloned(),
            },
        );
    }

    let volume = RadarVolume {
        radar: get("radar")?,
        latitude_deg: parse_f64("latitude_deg")?,
        longitude_deg: parse_f64("longitude_deg")?,
        altitude_m: parse_f64("altitude_m")?,
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
