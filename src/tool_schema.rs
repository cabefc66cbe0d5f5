//! CVAT shape documents (`converted_keypoints.json`, `converted_bbox.json`)
//! and the combined output document.
//!
//! These are wire types only. Documents read from disk are turned into raw
//! records by the parser and validated by the mappers; nothing downstream
//! works on these structures directly.

use serde::{Deserialize, Serialize};

use crate::config::ConversionConfig;
use crate::types::{AnnotationRecord, CombinedRecord, Pass, Shape, TrackId};

const TOOL_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeType {
    Skeleton,
    Rectangle,
}

/// One point of a skeleton shape, named by its topology slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolElement {
    pub label: String,
    pub points: Vec<f64>,
    #[serde(default)]
    pub outside: bool,
    #[serde(default)]
    pub occluded: bool,
}

/// One shape of one track in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolShape {
    #[serde(rename = "type")]
    pub shape_type: ShapeType,
    pub frame: i64,
    pub track_id: TrackId,
    pub label: String,
    #[serde(default)]
    pub outside: bool,
    #[serde(default)]
    pub occluded: bool,
    /// Rectangle corners `[xtl, ytl, xbr, ybr]`; empty for skeletons.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elements: Vec<ToolElement>,
}

impl ToolShape {
    fn from_record(record: &AnnotationRecord) -> Self {
        match &record.shape {
            Shape::Skeleton(set) => ToolShape {
                shape_type: ShapeType::Skeleton,
                frame: record.frame.0 as i64,
                track_id: record.track.clone(),
                label: record.label.clone(),
                outside: set.all_outside(),
                occluded: false,
                points: Vec::new(),
                elements: set
                    .points
                    .iter()
                    .map(|p| ToolElement {
                        label: p.name.clone(),
                        points: vec![p.x, p.y],
                        outside: p.outside,
                        occluded: p.occluded,
                    })
                    .collect(),
            },
            Shape::Rectangle(bbox) => ToolShape {
                shape_type: ShapeType::Rectangle,
                frame: record.frame.0 as i64,
                track_id: record.track.clone(),
                label: record.label.clone(),
                outside: bbox.outside,
                occluded: bbox.occluded,
                points: vec![
                    bbox.top_left.x,
                    bbox.top_left.y,
                    bbox.bottom_right.x,
                    bbox.bottom_right.y,
                ],
                elements: Vec::new(),
            },
        }
    }
}

/// A per-pass document in the annotation tool's import schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDocument {
    #[serde(default = "default_version")]
    pub version: String,
    pub kind: Pass,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skeleton: Vec<String>,
    pub shapes: Vec<ToolShape>,
}

fn default_version() -> String {
    TOOL_SCHEMA_VERSION.to_string()
}

impl ToolDocument {
    /// Encode mapped records of one pass, in the order given.
    pub fn from_records(kind: Pass, records: &[AnnotationRecord], config: &ConversionConfig) -> Self {
        let skeleton = match kind {
            Pass::Keypoints => config.skeleton.points.clone(),
            Pass::Bbox => Vec::new(),
        };
        Self {
            version: default_version(),
            kind,
            skeleton,
            shapes: records.iter().map(ToolShape::from_record).collect(),
        }
    }
}

/// Final output of the merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedDocument {
    #[serde(default = "default_version")]
    pub version: String,
    pub records: Vec<CombinedRecord>,
}

impl CombinedDocument {
    pub fn new(records: Vec<CombinedRecord>) -> Self {
        Self {
            version: default_version(),
            records,
        }
    }
}
