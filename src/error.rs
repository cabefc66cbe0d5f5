use std::fmt;

use crate::types::{Frame, JoinKey, Pass, TrackId};

/// Where in an input a bad value was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordLocation {
    /// 1-based line in a delimited file.
    Line(u64),
    /// 0-based entry in a structured document.
    Entry(usize),
    /// A key that is already known.
    Key(JoinKey),
    /// Whole-document problems (missing columns and the like).
    Document,
}

impl fmt::Display for RecordLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordLocation::Line(line) => write!(f, "line {}", line),
            RecordLocation::Entry(index) => write!(f, "entry {}", index),
            RecordLocation::Key(key) => write!(f, "{}", key),
            RecordLocation::Document => f.write_str("document"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnnotationError {
    #[error("Schema violation at {location}, field `{field}` = {value:?}: {reason}")]
    SchemaViolation {
        location: RecordLocation,
        field: String,
        value: String,
        reason: String,
    },

    #[error("Topology mismatch at frame {frame}, track {track}: point {point:?} is not in the skeleton")]
    TopologyMismatch {
        frame: Frame,
        track: TrackId,
        point: String,
    },

    #[error("Degenerate box at frame {frame}, track {track}: width {width}, height {height}")]
    DegenerateBox {
        frame: Frame,
        track: TrackId,
        width: f64,
        height: f64,
    },

    #[error("Track {track} at frame {frame} has label {found:?} but was first seen as {expected:?}")]
    TrackLabelConflict {
        track: TrackId,
        frame: Frame,
        expected: String,
        found: String,
    },

    #[error("Duplicate {pass} record for frame {frame}, track {track}")]
    DuplicateKey {
        pass: Pass,
        frame: Frame,
        track: TrackId,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl AnnotationError {
    /// Stable name of the error kind, for structured reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            AnnotationError::SchemaViolation { .. } => "SchemaViolation",
            AnnotationError::TopologyMismatch { .. } => "TopologyMismatch",
            AnnotationError::DegenerateBox { .. } => "DegenerateBox",
            AnnotationError::TrackLabelConflict { .. } => "TrackLabelConflict",
            AnnotationError::DuplicateKey { .. } => "DuplicateKey",
            AnnotationError::Config(_) => "Config",
            AnnotationError::Io(_) => "Io",
            AnnotationError::Json(_) => "Json",
            AnnotationError::Csv(_) => "Csv",
            AnnotationError::Xml(_) => "Xml",
            AnnotationError::Archive(_) => "Archive",
        }
    }

    pub(crate) fn schema(
        location: RecordLocation,
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        AnnotationError::SchemaViolation {
            location,
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn duplicate(pass: Pass, key: &JoinKey) -> Self {
        AnnotationError::DuplicateKey {
            pass,
            frame: key.frame,
            track: key.track.clone(),
        }
    }
}

pub type Result<T, E = AnnotationError> = std::result::Result<T, E>;
