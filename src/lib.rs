//! Keypoint and bounding-box annotation converter for CVAT
//!
//! This library maps raw keypoint and box annotations onto CVAT's import
//! schema and merges the corrected keypoint and box exports back into one
//! record set keyed by frame and track.

pub mod bbox;
pub mod coco;
pub mod config;
pub mod cvat_xml;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod io;
pub mod keypoints;
pub mod merge;
pub mod parser;
pub mod pipeline;
pub mod tool_schema;
pub mod types;
pub mod utils;
pub mod validate;

// Re-export commonly used types and functions
pub use config::{ConversionConfig, ConvertArgs, Format, MergeArgs, MergeFormat};
pub use error::{AnnotationError, RecordLocation, Result};
pub use exchange::{AnnotationTool, StagingDirectory, TaskHandle};
pub use merge::merge;
pub use pipeline::{convert_bboxes, convert_keypoints, derive_bboxes, merge_exports, stage_task};
pub use types::{
    AnnotationRecord, BoundingBox, CombinedRecord, Frame, JoinKey, Keypoint, KeypointSet, Pass,
    Shape, TrackId,
};
