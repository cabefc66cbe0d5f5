//! End-to-end stages driven by the binaries.

use log::{info, warn};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

use crate::bbox::{derive_from_keypoints, BoxMapper};
use crate::coco::{combined_to_coco, records_to_coco};
use crate::config::{ConversionConfig, ConvertArgs, Format, MergeArgs, MergeFormat, StageArgs};
use crate::cvat_xml::write_tracks;
use crate::error::Result;
use crate::exchange::{AnnotationTool, StagingDirectory, TaskHandle};
use crate::identity::IdentityCorrelator;
use crate::io::{discover_images, open_box_records, open_keypoint_records, read_export, write_atomic, write_json_atomic};
use crate::keypoints::KeypointMapper;
use crate::merge::merge_with_summary;
use crate::parser::RawShape;
use crate::tool_schema::{CombinedDocument, ToolDocument};
use crate::types::{AnnotationRecord, ConversionStats, Pass};

fn load_config(path: &Path, threshold: Option<f64>) -> Result<ConversionConfig> {
    let config = ConversionConfig::load(path)?;
    Ok(match threshold {
        Some(threshold) => config.with_visibility_threshold(threshold),
        None => config,
    })
}

/// Write one pass of mapped records in the requested format.
pub fn write_records(
    path: &Path,
    pass: Pass,
    records: &[AnnotationRecord],
    config: &ConversionConfig,
    format: Format,
    task_name: &str,
) -> Result<()> {
    match format {
        Format::Json => write_json_atomic(path, &ToolDocument::from_records(pass, records, config)),
        Format::Coco => write_json_atomic(path, &records_to_coco(records, config)),
        Format::Xml => write_atomic(path, |writer| {
            write_tracks(writer, records, config, task_name)?;
            Ok(())
        }),
    }
}

/// Map raw keypoints and write `converted_keypoints`.
pub fn convert_keypoints(args: &ConvertArgs) -> Result<PathBuf> {
    let config = load_config(&args.config, args.visibility_threshold)?;
    info!("Reading keypoints from {}", args.input.display());
    let raw = open_keypoint_records(&args.input, &config)?;

    let mut stats = ConversionStats::new();
    let correlator = IdentityCorrelator::new();
    let records = KeypointMapper::new(&config).map_all(raw, &correlator, &mut stats)?;

    let output = args.output_path(Pass::Keypoints);
    write_records(&output, Pass::Keypoints, &records, &config, args.output_format, &args.task_name)?;
    info!(
        "Wrote {} skeletons for {} tracks to {}",
        records.len(),
        correlator.track_count(),
        output.display()
    );
    stats.print_summary();
    Ok(output)
}

/// Map raw boxes and write `converted_bbox`.
pub fn convert_bboxes(args: &ConvertArgs) -> Result<PathBuf> {
    let config = load_config(&args.config, args.visibility_threshold)?;
    info!("Reading boxes from {}", args.input.display());
    let raw = open_box_records(&args.input, &config)?;

    let mut stats = ConversionStats::new();
    let correlator = IdentityCorrelator::new();
    let records = BoxMapper::new(&config).map_all(raw, &correlator, &mut stats)?;

    let output = args.output_path(Pass::Bbox);
    write_records(&output, Pass::Bbox, &records, &config, args.output_format, &args.task_name)?;
    info!("Wrote {} boxes to {}", records.len(), output.display());
    stats.print_summary();
    Ok(output)
}

/// Build boxes from raw keypoints and write `converted_bbox`.
pub fn derive_bboxes(args: &ConvertArgs) -> Result<PathBuf> {
    let config = load_config(&args.config, args.visibility_threshold)?;
    info!("Deriving boxes from keypoints in {}", args.input.display());
    let raw = open_keypoint_records(&args.input, &config)?;

    let mut stats = ConversionStats::new();
    let skeletons = KeypointMapper::new(&config).map_all(raw, &IdentityCorrelator::new(), &mut stats)?;
    // Only the derived boxes count as emitted.
    stats.records_emitted = 0;
    let records = derive_from_keypoints(&skeletons, &mut stats);

    let output = args.output_path(Pass::Bbox);
    write_records(&output, Pass::Bbox, &records, &config, args.output_format, &args.task_name)?;
    info!("Wrote {} derived boxes to {}", records.len(), output.display());
    stats.print_summary();
    Ok(output)
}

/// Map every shape of a corrected export on its own, so that a repeated key
/// survives until the merge can report it.
pub fn map_export(
    shapes: Vec<RawShape>,
    config: &ConversionConfig,
    stats: &mut ConversionStats,
) -> Result<Vec<AnnotationRecord>> {
    stats.records_read += shapes.len();
    let keypoints = KeypointMapper::new(config);
    let boxes = BoxMapper::new(config);
    let mapped = shapes
        .into_par_iter()
        .map(|shape| match shape {
            RawShape::Keypoints(raw) => keypoints.map_one(raw).map(|record| (record, false)),
            RawShape::Box(raw) => boxes
                .map_one(raw)
                .map(|(record, correction)| (record, correction.is_some())),
        })
        .collect::<Result<Vec<_>>>()?;

    stats.corrections += mapped.iter().filter(|(_, corrected)| *corrected).count();
    Ok(mapped.into_iter().map(|(record, _)| record).collect())
}

/// Merge the two corrected exports and write the combined document.
pub fn merge_exports(args: &MergeArgs) -> Result<PathBuf> {
    let config = load_config(&args.config, None)?;
    let mut stats = ConversionStats::new();

    info!("Reading keypoints export {}", args.keypoints.display());
    let first = map_export(read_export(&args.keypoints, &config)?, &config, &mut stats)?;
    info!("Reading bbox export {}", args.bbox.display());
    let second = map_export(read_export(&args.bbox, &config)?, &config, &mut stats)?;

    let (records, summary) = merge_with_summary(first, second, &config)?;
    stats.records_emitted = records.len();
    match args.output_format {
        MergeFormat::Json => write_json_atomic(&args.output, &CombinedDocument::new(records))?,
        MergeFormat::Coco => write_json_atomic(&args.output, &combined_to_coco(&records, &config))?,
    }
    info!("Wrote combined annotations to {}", args.output.display());
    stats.print_summary();
    summary.print_summary();
    Ok(args.output.clone())
}

/// Create a staged task with its images and converted documents.
pub fn stage_task(args: &StageArgs) -> Result<TaskHandle> {
    let config = ConversionConfig::load(&args.config)?;
    let mut tool = StagingDirectory::new(&args.root);
    let task = tool.create_task(&args.task_name, &config.label_set())?;

    let images = discover_images(&args.images)?;
    if images.is_empty() {
        warn!("No images found in {}", args.images.display());
    }
    tool.upload_images(&task, &images)?;
    for document in &args.annotations {
        tool.import_annotations(&task, document)?;
    }
    Ok(task)
}
