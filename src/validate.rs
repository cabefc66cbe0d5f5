//! Checks shared by the parser, the mappers and the merge.
//!
//! Every record that enters or leaves a stage passes through here, so the
//! invariants of the data model are enforced in one place.

use crate::config::ConversionConfig;
use crate::error::{AnnotationError, RecordLocation, Result};
use crate::types::{AnnotationRecord, BoundingBox, Frame, JoinKey, KeypointSet, Shape};

/// Parse a frame index cell. Accepts `3` and `3.0`.
pub fn parse_frame(
    config: &ConversionConfig,
    raw: &str,
    field: &str,
    location: &RecordLocation,
) -> Result<Frame> {
    let value = parse_number(raw, field, location)?;
    if value.fract() != 0.0 {
        return Err(AnnotationError::schema(
            location.clone(),
            field,
            raw,
            "frame index is not a whole number",
        ));
    }
    frame_in_range(config, value as i64, field, location)
}

/// Check a signed frame index against the declared sequence.
pub fn frame_in_range(
    config: &ConversionConfig,
    frame: i64,
    field: &str,
    location: &RecordLocation,
) -> Result<Frame> {
    if frame < 0 {
        return Err(AnnotationError::schema(
            location.clone(),
            field,
            frame.to_string(),
            "frame index is negative",
        ));
    }
    let frame = frame as u64;
    if let Some(length) = config.sequence_length {
        if frame >= length {
            return Err(AnnotationError::schema(
                location.clone(),
                field,
                frame.to_string(),
                format!("frame index is beyond the sequence length {}", length),
            ));
        }
    }
    Ok(Frame(frame))
}

/// Parse a finite number.
pub fn parse_number(raw: &str, field: &str, location: &RecordLocation) -> Result<f64> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(AnnotationError::schema(
            location.clone(),
            field,
            raw,
            "not a finite number",
        )),
    }
}

/// Parse an optional boolean cell; blank means `false`.
pub fn parse_flag(raw: &str, field: &str, location: &RecordLocation) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "n" => Ok(false),
        "1" | "true" | "yes" | "y" => Ok(true),
        _ => Err(AnnotationError::schema(
            location.clone(),
            field,
            raw,
            "not a boolean flag",
        )),
    }
}

/// Check that a label is non-empty and declared in the configuration.
pub fn check_label(
    config: &ConversionConfig,
    label: &str,
    field: &str,
    location: &RecordLocation,
) -> Result<String> {
    let label = label.trim();
    if label.is_empty() {
        return Err(AnnotationError::schema(
            location.clone(),
            field,
            label,
            "label name is empty",
        ));
    }
    if !config.accepts_label(label) {
        return Err(AnnotationError::schema(
            location.clone(),
            field,
            label,
            format!("label is not one of {:?}", config.label_set()),
        ));
    }
    Ok(label.to_string())
}

/// A skeleton must carry every declared slot, in topology order.
pub fn check_keypoint_set(
    config: &ConversionConfig,
    key: &JoinKey,
    set: &KeypointSet,
) -> Result<()> {
    let topology = &config.skeleton;
    if set.len() != topology.len() {
        return Err(AnnotationError::schema(
            RecordLocation::Key(key.clone()),
            "points",
            set.len().to_string(),
            format!("skeleton declares {} points", topology.len()),
        ));
    }
    for (index, (point, name)) in set.points.iter().zip(&topology.points).enumerate() {
        if point.index != index || &point.name != name {
            return Err(AnnotationError::TopologyMismatch {
                frame: key.frame,
                track: key.track.clone(),
                point: point.name.clone(),
            });
        }
        if !point.x.is_finite() || !point.y.is_finite() {
            return Err(AnnotationError::schema(
                RecordLocation::Key(key.clone()),
                name.as_str(),
                format!("({}, {})", point.x, point.y),
                "coordinate is not finite",
            ));
        }
    }
    Ok(())
}

/// A box must have its top-left corner strictly before its bottom-right one.
pub fn check_box(key: &JoinKey, bbox: &BoundingBox) -> Result<()> {
    let coords = [
        bbox.top_left.x,
        bbox.top_left.y,
        bbox.bottom_right.x,
        bbox.bottom_right.y,
    ];
    if coords.iter().any(|c| !c.is_finite()) {
        return Err(AnnotationError::schema(
            RecordLocation::Key(key.clone()),
            "points",
            format!("{:?}", coords),
            "coordinate is not finite",
        ));
    }
    if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
        return Err(AnnotationError::DegenerateBox {
            frame: key.frame,
            track: key.track.clone(),
            width: bbox.width(),
            height: bbox.height(),
        });
    }
    Ok(())
}

/// Full check of a mapped record.
pub fn check_record(config: &ConversionConfig, record: &AnnotationRecord) -> Result<()> {
    let key = record.key();
    let location = RecordLocation::Key(key.clone());
    frame_in_range(config, record.frame.0 as i64, "frame", &location)?;
    check_label(config, &record.label, "label", &location)?;
    match &record.shape {
        Shape::Skeleton(set) => check_keypoint_set(config, &key, set),
        Shape::Rectangle(bbox) => check_box(&key, bbox),
    }
}
