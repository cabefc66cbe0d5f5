use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

// Supported image formats
pub const IMG_FORMATS: &[&str] = &[
    "bmp", "dng", "jpeg", "jpg", "mpo", "png", "tif", "tiff", "webp", "pfm",
];

// Precomputed HashSet of image extensions for fast lookup
pub static IMAGE_EXTENSIONS_SET: OnceLock<HashSet<String>> = OnceLock::new();

/// Get the image extensions set
pub fn get_image_extensions_set() -> &'static HashSet<String> {
    IMAGE_EXTENSIONS_SET.get_or_init(|| IMG_FORMATS.iter().map(|ext| ext.to_lowercase()).collect())
}

/// Index of a frame in the annotated image sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame(pub u64);

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one physical object across frames.
///
/// Decimal identifiers in canonical form are numeric, so `"7"` and `7`
/// denote the same track while `"007"` stays a distinct named track.
/// Ordering puts numeric ids first (numerically), then named ids
/// (lexicographically).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrackId {
    Numeric(u64),
    Named(String),
}

impl TrackId {
    /// Parse a track identifier from text. Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(id) = raw.parse::<u64>() {
            if id.to_string() == raw {
                return Some(TrackId::Numeric(id));
            }
        }
        Some(TrackId::Named(raw.to_string()))
    }
}

impl From<u64> for TrackId {
    fn from(id: u64) -> Self {
        TrackId::Numeric(id)
    }
}

impl From<&str> for TrackId {
    fn from(raw: &str) -> Self {
        TrackId::parse(raw).unwrap_or_else(|| TrackId::Named(String::new()))
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackId::Numeric(id) => write!(f, "{}", id),
            TrackId::Named(name) => write!(f, "{}", name),
        }
    }
}

impl Serialize for TrackId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TrackId::Numeric(id) => serializer.serialize_u64(*id),
            TrackId::Named(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for TrackId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TrackIdVisitor;

        impl<'de> Visitor<'de> for TrackIdVisitor {
            type Value = TrackId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a non-negative integer or a non-empty string")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<TrackId, E> {
                Ok(TrackId::Numeric(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<TrackId, E> {
                u64::try_from(value)
                    .map(TrackId::Numeric)
                    .map_err(|_| E::custom(format!("negative track id {}", value)))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<TrackId, E> {
                if value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 {
                    Ok(TrackId::Numeric(value as u64))
                } else {
                    Err(E::custom(format!("track id {} is not a whole number", value)))
                }
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<TrackId, E> {
                TrackId::parse(value).ok_or_else(|| E::custom("empty track id"))
            }
        }

        deserializer.deserialize_any(TrackIdVisitor)
    }
}

/// Which correction pass a shape belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    Keypoints,
    Bbox,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::Keypoints => f.write_str("keypoints"),
            Pass::Bbox => f.write_str("bbox"),
        }
    }
}

/// The (frame, track) pair that joins keypoint and box records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JoinKey {
    pub frame: Frame,
    pub track: TrackId,
}

impl JoinKey {
    pub fn new(frame: Frame, track: TrackId) -> Self {
        Self { frame, track }
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {}, track {}", self.frame, self.track)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One slot of a skeleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub index: usize,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub outside: bool,
    pub occluded: bool,
}

impl Keypoint {
    /// A slot with no data for this frame.
    pub fn absent(index: usize, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
            x: 0.0,
            y: 0.0,
            outside: true,
            occluded: false,
        }
    }
}

/// A full skeleton instance, one entry per declared topology slot in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeypointSet {
    pub points: Vec<Keypoint>,
}

impl KeypointSet {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points that are present in this frame.
    pub fn visible(&self) -> impl Iterator<Item = &Keypoint> {
        self.points.iter().filter(|p| !p.outside)
    }

    /// True when every slot is marked outside.
    pub fn all_outside(&self) -> bool {
        self.points.iter().all(|p| p.outside)
    }
}

/// Axis-aligned rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top_left: Point,
    pub bottom_right: Point,
    pub outside: bool,
    pub occluded: bool,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        self.bottom_right.x - self.top_left.x
    }

    pub fn height(&self) -> f64 {
        self.bottom_right.y - self.top_left.y
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// COCO-style `[x, y, width, height]`.
    pub fn to_xywh(&self) -> [f64; 4] {
        [self.top_left.x, self.top_left.y, self.width(), self.height()]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Skeleton(KeypointSet),
    Rectangle(BoundingBox),
}

impl Shape {
    pub fn pass(&self) -> Pass {
        match self {
            Shape::Skeleton(_) => Pass::Keypoints,
            Shape::Rectangle(_) => Pass::Bbox,
        }
    }
}

/// A mapped annotation for one (frame, track) in one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRecord {
    pub frame: Frame,
    pub track: TrackId,
    pub label: String,
    pub shape: Shape,
}

impl AnnotationRecord {
    pub fn key(&self) -> JoinKey {
        JoinKey::new(self.frame, self.track.clone())
    }

    pub fn pass(&self) -> Pass {
        self.shape.pass()
    }
}

/// Merged annotation for one (frame, track). `None` marks an absent shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedRecord {
    pub frame: Frame,
    #[serde(rename = "track_id")]
    pub track: TrackId,
    pub label: String,
    pub keypoints: Option<KeypointSet>,
    pub bbox: Option<BoundingBox>,
}

impl CombinedRecord {
    pub fn key(&self) -> JoinKey {
        JoinKey::new(self.frame, self.track.clone())
    }

    /// Split back into the keypoint record and the box record it was built from.
    pub fn split(self) -> (Option<AnnotationRecord>, Option<AnnotationRecord>) {
        let CombinedRecord {
            frame,
            track,
            label,
            keypoints,
            bbox,
        } = self;
        let keypoint_record = keypoints.map(|set| AnnotationRecord {
            frame,
            track: track.clone(),
            label: label.clone(),
            shape: Shape::Skeleton(set),
        });
        let box_record = bbox.map(|bbox| AnnotationRecord {
            frame,
            track,
            label,
            shape: Shape::Rectangle(bbox),
        });
        (keypoint_record, box_record)
    }
}

/// A non-fatal fix applied to a box while mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub key: JoinKey,
    pub swapped_x: bool,
    pub swapped_y: bool,
}

impl fmt::Display for Correction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes = match (self.swapped_x, self.swapped_y) {
            (true, true) => "x and y",
            (true, false) => "x",
            _ => "y",
        };
        write!(f, "{}: swapped inverted {} corner coordinates", self.key, axes)
    }
}

// Struct to hold processing statistics
#[derive(Debug, Default, Clone)]
pub struct ConversionStats {
    pub records_read: usize,
    pub records_emitted: usize,
    pub points_marked_outside: usize,
    pub corrections: usize,
    pub shapes_skipped: usize,
}

impl ConversionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print_summary(&self) {
        log::info!("=== Conversion Summary ===");
        log::info!("Raw records read: {}", self.records_read);
        log::info!("Annotation records emitted: {}", self.records_emitted);
        log::info!("Keypoints marked outside: {}", self.points_marked_outside);
        if self.corrections > 0 {
            log::warn!("Box corrections applied: {}", self.corrections);
        }
        if self.shapes_skipped > 0 {
            log::warn!("Shapes without usable geometry: {}", self.shapes_skipped);
        }
    }
}
