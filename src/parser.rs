//! Turns raw tabular and structured input into typed raw records.
//!
//! Delimited input is read lazily row by row. Any malformed row fails the
//! whole batch with a `SchemaViolation` naming the line and the field; rows
//! are never skipped, since a dropped row would silently desynchronize the
//! keypoint and box passes.

use csv::{ReaderBuilder, StringRecord, Trim};
use serde_json::Value;
use std::fmt;
use std::io::Read;

use crate::coco::{Annotation, CocoFile};
use crate::config::ConversionConfig;
use crate::error::{AnnotationError, RecordLocation, Result};
use crate::tool_schema::{ShapeType, ToolDocument, ToolShape};
use crate::types::{Frame, Pass, TrackId};
use crate::validate::{check_label, frame_in_range, parse_flag, parse_frame, parse_number};

const FRAME_COLUMNS: &[&str] = &["frame_id", "frame", "frame_idx", "frame_index"];
const TRACK_COLUMNS: &[&str] = &["track_id", "instance_id", "track"];
const LABEL_COLUMNS: &[&str] = &["label", "class_name"];
const CLASS_COLUMNS: &[&str] = &["class_id", "category_id"];
const POINT_COLUMNS: &[&str] = &["point", "keypoint", "bodypart", "node"];
const SCORE_COLUMNS: &[&str] = &["score", "likelihood", "confidence"];

/// Lazy sequence of parsed records.
pub type RecordIter<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

/// How a raw point names its skeleton slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for PointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointRef::Index(index) => write!(f, "#{}", index),
            PointRef::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawPoint {
    pub point: PointRef,
    pub x: f64,
    pub y: f64,
    pub outside: bool,
    pub occluded: bool,
}

/// Keypoints of one track in one frame, as found in one input row or shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RawKeypointRecord {
    pub location: RecordLocation,
    pub frame: Frame,
    pub track: TrackId,
    pub label: String,
    pub points: Vec<RawPoint>,
}

/// Box of one track in one frame, corners in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBoxRecord {
    pub location: RecordLocation,
    pub frame: Frame,
    pub track: TrackId,
    pub label: String,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub outside: bool,
    pub occluded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawShape {
    Keypoints(RawKeypointRecord),
    Box(RawBoxRecord),
}

struct Columns {
    headers: Vec<String>,
}

impl Columns {
    fn new(headers: &StringRecord) -> Self {
        Self {
            headers: headers.iter().map(|h| h.trim().to_string()).collect(),
        }
    }

    fn find(&self, candidates: &[&str]) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| candidates.iter().any(|c| h.eq_ignore_ascii_case(c)))
    }

    fn exact(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    fn require(&self, field: &str, candidates: &[&str]) -> Result<usize> {
        self.find(candidates).ok_or_else(|| {
            AnnotationError::schema(
                RecordLocation::Document,
                field,
                "",
                format!("missing required column (one of {:?})", candidates),
            )
        })
    }

    fn name(&self, index: usize) -> &str {
        self.headers.get(index).map(String::as_str).unwrap_or("")
    }
}

enum LabelColumn {
    Name(usize),
    Class(usize),
    Default,
}

struct IdentityColumns {
    frame: usize,
    track: usize,
    label: LabelColumn,
}

impl IdentityColumns {
    fn detect(columns: &Columns) -> Result<Self> {
        let frame = columns.require("frame_id", FRAME_COLUMNS)?;
        let track = columns.require("track_id", TRACK_COLUMNS)?;
        let label = if let Some(index) = columns.find(LABEL_COLUMNS) {
            LabelColumn::Name(index)
        } else if let Some(index) = columns.find(CLASS_COLUMNS) {
            LabelColumn::Class(index)
        } else {
            LabelColumn::Default
        };
        Ok(Self {
            frame,
            track,
            label,
        })
    }

    fn read(
        &self,
        config: &ConversionConfig,
        columns: &Columns,
        record: &StringRecord,
        location: &RecordLocation,
    ) -> Result<(Frame, TrackId, String)> {
        let frame = parse_frame(
            config,
            cell(record, self.frame),
            columns.name(self.frame),
            location,
        )?;
        let raw_track = cell(record, self.track);
        let track = TrackId::parse(raw_track).ok_or_else(|| {
            AnnotationError::schema(
                location.clone(),
                columns.name(self.track),
                raw_track,
                "track identifier is empty",
            )
        })?;
        let label = match self.label {
            LabelColumn::Name(index) => {
                check_label(config, cell(record, index), columns.name(index), location)?
            }
            LabelColumn::Class(index) => {
                let raw = cell(record, index);
                let class_id = parse_number(raw, columns.name(index), location)?;
                let label = (class_id >= 0.0 && class_id.fract() == 0.0)
                    .then(|| config.label_for_class(class_id as usize))
                    .flatten()
                    .ok_or_else(|| {
                        AnnotationError::schema(
                            location.clone(),
                            columns.name(index),
                            raw,
                            "class id does not name a configured label",
                        )
                    })?;
                label.to_string()
            }
            LabelColumn::Default => config.skeleton.label.clone(),
        };
        Ok((frame, track, label))
    }
}

fn cell(record: &StringRecord, index: usize) -> &str {
    record.get(index).unwrap_or("")
}

// Pose estimators write `nan` for undetected points.
fn is_blank(raw: &str) -> bool {
    let raw = raw.trim();
    raw.is_empty() || raw.eq_ignore_ascii_case("nan")
}

fn location_of(record: &StringRecord, fallback: usize) -> RecordLocation {
    RecordLocation::Line(
        record
            .position()
            .map(|p| p.line())
            .unwrap_or(fallback as u64 + 2),
    )
}

fn csv_reader<R: Read>(reader: R, delimiter: u8) -> csv::Reader<R> {
    ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(Trim::All)
        .from_reader(reader)
}

/// Columns holding one keypoint in a wide layout.
struct PointColumns {
    point: PointRef,
    x: usize,
    y: usize,
    score: Option<usize>,
    outside: Option<usize>,
    occluded: Option<usize>,
}

enum KeypointLayout {
    /// One row per (track, frame), a column group per point.
    Wide(Vec<PointColumns>),
    /// One row per point.
    Long {
        point: usize,
        x: usize,
        y: usize,
        score: Option<usize>,
        outside: Option<usize>,
        occluded: Option<usize>,
    },
}

impl KeypointLayout {
    fn detect(columns: &Columns) -> Result<Self> {
        if let Some(point) = columns.find(POINT_COLUMNS) {
            return Ok(KeypointLayout::Long {
                point,
                x: columns.require("x", &["x"])?,
                y: columns.require("y", &["y"])?,
                score: columns.find(SCORE_COLUMNS),
                outside: columns.find(&["outside"]),
                occluded: columns.find(&["occluded"]),
            });
        }

        // x0,y0,score0,x1,y1,score1,...
        let mut indexed = Vec::new();
        while let (Some(x), Some(y)) = (
            columns.exact(&format!("x{}", indexed.len())),
            columns.exact(&format!("y{}", indexed.len())),
        ) {
            let i = indexed.len();
            indexed.push(PointColumns {
                point: PointRef::Index(i),
                x,
                y,
                score: columns.exact(&format!("score{}", i)),
                outside: columns.exact(&format!("outside{}", i)),
                occluded: columns.exact(&format!("occluded{}", i)),
            });
        }
        if !indexed.is_empty() {
            return Ok(KeypointLayout::Wide(indexed));
        }

        // <name>_x,<name>_y,<name>_score,...
        let mut named = Vec::new();
        for (x, header) in columns.headers.iter().enumerate() {
            let Some(name) = header.strip_suffix("_x").filter(|n| !n.is_empty()) else {
                continue;
            };
            let y = columns.exact(&format!("{}_y", name)).ok_or_else(|| {
                AnnotationError::schema(
                    RecordLocation::Document,
                    format!("{}_y", name),
                    "",
                    format!("column {} has no matching y column", header),
                )
            })?;
            named.push(PointColumns {
                point: PointRef::Name(name.to_string()),
                x,
                y,
                score: columns
                    .exact(&format!("{}_score", name))
                    .or_else(|| columns.exact(&format!("{}_likelihood", name))),
                outside: columns.exact(&format!("{}_outside", name)),
                occluded: columns.exact(&format!("{}_occluded", name)),
            });
        }
        if !named.is_empty() {
            return Ok(KeypointLayout::Wide(named));
        }

        Err(AnnotationError::schema(
            RecordLocation::Document,
            "x0",
            "",
            "no keypoint coordinate columns found",
        ))
    }
}

struct Visibility {
    score: Option<usize>,
    outside: Option<usize>,
    occluded: Option<usize>,
}

impl Visibility {
    fn read(
        &self,
        config: &ConversionConfig,
        columns: &Columns,
        record: &StringRecord,
        location: &RecordLocation,
    ) -> Result<(bool, bool)> {
        let flag = |column: Option<usize>| match column {
            Some(index) => parse_flag(cell(record, index), columns.name(index), location),
            None => Ok(false),
        };
        let mut outside = flag(self.outside)?;
        let mut occluded = flag(self.occluded)?;
        if let Some(index) = self.score {
            let raw = cell(record, index);
            if !is_blank(raw) {
                let score = parse_number(raw, columns.name(index), location)?;
                if score <= 0.0 {
                    outside = true;
                } else if score <= config.visibility_threshold {
                    occluded = true;
                }
            }
        }
        Ok((outside, occluded))
    }
}

fn read_coordinates(
    columns: &Columns,
    record: &StringRecord,
    x: usize,
    y: usize,
    location: &RecordLocation,
) -> Result<Option<(f64, f64)>> {
    let (raw_x, raw_y) = (cell(record, x), cell(record, y));
    match (is_blank(raw_x), is_blank(raw_y)) {
        (true, true) => Ok(None),
        (false, false) => Ok(Some((
            parse_number(raw_x, columns.name(x), location)?,
            parse_number(raw_y, columns.name(y), location)?,
        ))),
        (true, false) => Err(AnnotationError::schema(
            location.clone(),
            columns.name(x),
            raw_x,
            "coordinate pair is incomplete",
        )),
        (false, true) => Err(AnnotationError::schema(
            location.clone(),
            columns.name(y),
            raw_y,
            "coordinate pair is incomplete",
        )),
    }
}

fn read_keypoint_row(
    config: &ConversionConfig,
    columns: &Columns,
    identity: &IdentityColumns,
    layout: &KeypointLayout,
    record: &StringRecord,
    location: RecordLocation,
) -> Result<RawKeypointRecord> {
    let (frame, track, label) = identity.read(config, columns, record, &location)?;
    let mut points = Vec::new();
    match layout {
        KeypointLayout::Wide(groups) => {
            for group in groups {
                let Some((x, y)) = read_coordinates(columns, record, group.x, group.y, &location)?
                else {
                    continue;
                };
                let visibility = Visibility {
                    score: group.score,
                    outside: group.outside,
                    occluded: group.occluded,
                };
                let (outside, occluded) = visibility.read(config, columns, record, &location)?;
                points.push(RawPoint {
                    point: group.point.clone(),
                    x,
                    y,
                    outside,
                    occluded,
                });
            }
        }
        KeypointLayout::Long {
            point,
            x,
            y,
            score,
            outside,
            occluded,
        } => {
            let name = cell(record, *point);
            if name.is_empty() {
                return Err(AnnotationError::schema(
                    location,
                    columns.name(*point),
                    name,
                    "point name is empty",
                ));
            }
            let visibility = Visibility {
                score: *score,
                outside: *outside,
                occluded: *occluded,
            };
            let (is_outside, is_occluded) = visibility.read(config, columns, record, &location)?;
            let raw = match read_coordinates(columns, record, *x, *y, &location)? {
                Some((x, y)) => RawPoint {
                    point: PointRef::Name(name.to_string()),
                    x,
                    y,
                    outside: is_outside,
                    occluded: is_occluded,
                },
                // A named point without coordinates is explicitly not in frame.
                None => RawPoint {
                    point: PointRef::Name(name.to_string()),
                    x: 0.0,
                    y: 0.0,
                    outside: true,
                    occluded: false,
                },
            };
            points.push(raw);
        }
    }
    Ok(RawKeypointRecord {
        location,
        frame,
        track,
        label,
        points,
    })
}

/// Lazily parse delimited keypoint rows.
///
/// Three layouts are recognized: wide indexed (`x0,y0,score0,...`), wide
/// named (`Snout_x,Snout_y,...`) and long (one row per point with a `point`
/// column).
pub fn keypoint_records_from_csv<'a, R: Read + 'a>(
    reader: R,
    delimiter: u8,
    config: &'a ConversionConfig,
) -> Result<RecordIter<'a, RawKeypointRecord>> {
    let mut reader = csv_reader(reader, delimiter);
    let columns = Columns::new(reader.headers()?);
    let identity = IdentityColumns::detect(&columns)?;
    let layout = KeypointLayout::detect(&columns)?;

    Ok(Box::new(reader.into_records().enumerate().map(
        move |(index, record)| -> Result<RawKeypointRecord> {
            let record = record?;
            let location = location_of(&record, index);
            read_keypoint_row(config, &columns, &identity, &layout, &record, location)
        },
    )))
}

enum BoxColumns {
    Corners { x1: usize, y1: usize, x2: usize, y2: usize },
    Extent { x: usize, y: usize, width: usize, height: usize },
}

impl BoxColumns {
    fn detect(columns: &Columns) -> Result<Self> {
        let corners = (
            columns.find(&["x1", "xtl", "x_min", "xmin"]),
            columns.find(&["y1", "ytl", "y_min", "ymin"]),
            columns.find(&["x2", "xbr", "x_max", "xmax"]),
            columns.find(&["y2", "ybr", "y_max", "ymax"]),
        );
        if let (Some(x1), Some(y1), Some(x2), Some(y2)) = corners {
            return Ok(BoxColumns::Corners { x1, y1, x2, y2 });
        }
        let extent = (
            columns.find(&["x", "left"]),
            columns.find(&["y", "top"]),
            columns.find(&["width", "w"]),
            columns.find(&["height", "h"]),
        );
        if let (Some(x), Some(y), Some(width), Some(height)) = extent {
            return Ok(BoxColumns::Extent {
                x,
                y,
                width,
                height,
            });
        }
        Err(AnnotationError::schema(
            RecordLocation::Document,
            "x1",
            "",
            "missing box columns (x1,y1,x2,y2 or x,y,width,height)",
        ))
    }

    fn read(
        &self,
        columns: &Columns,
        record: &StringRecord,
        location: &RecordLocation,
    ) -> Result<(f64, f64, f64, f64)> {
        let number = |index: usize| {
            let raw = cell(record, index);
            if is_blank(raw) {
                return Err(AnnotationError::schema(
                    location.clone(),
                    columns.name(index),
                    raw,
                    "box coordinate is missing",
                ));
            }
            parse_number(raw, columns.name(index), location)
        };
        match *self {
            BoxColumns::Corners { x1, y1, x2, y2 } => {
                Ok((number(x1)?, number(y1)?, number(x2)?, number(y2)?))
            }
            BoxColumns::Extent {
                x,
                y,
                width,
                height,
            } => {
                let (x, y) = (number(x)?, number(y)?);
                Ok((x, y, x + number(width)?, y + number(height)?))
            }
        }
    }
}

/// Lazily parse delimited bounding-box rows.
pub fn box_records_from_csv<'a, R: Read + 'a>(
    reader: R,
    delimiter: u8,
    config: &'a ConversionConfig,
) -> Result<RecordIter<'a, RawBoxRecord>> {
    let mut reader = csv_reader(reader, delimiter);
    let columns = Columns::new(reader.headers()?);
    let identity = IdentityColumns::detect(&columns)?;
    let corners = BoxColumns::detect(&columns)?;
    let visibility = Visibility {
        score: None,
        outside: columns.find(&["outside"]),
        occluded: columns.find(&["occluded"]),
    };

    Ok(Box::new(reader.into_records().enumerate().map(
        move |(index, record)| -> Result<RawBoxRecord> {
            let record = record?;
            let location = location_of(&record, index);
            let (frame, track, label) = identity.read(config, &columns, &record, &location)?;
            let (x1, y1, x2, y2) = corners.read(&columns, &record, &location)?;
            let (outside, occluded) = visibility.read(config, &columns, &record, &location)?;
            Ok(RawBoxRecord {
                location,
                frame,
                track,
                label,
                x1,
                y1,
                x2,
                y2,
                outside,
                occluded,
            })
        },
    )))
}

/// Parse a structured document: either a CVAT shape document or a COCO
/// document. `want` restricts the shapes to one pass; with `None` each
/// entry's own shape decides (COCO entries with keypoints are skeletons).
pub fn records_from_json<R: Read>(
    reader: R,
    config: &ConversionConfig,
    want: Option<Pass>,
) -> Result<Vec<RawShape>> {
    let value: Value = serde_json::from_reader(reader)?;
    let malformed = |e: serde_json::Error| {
        AnnotationError::schema(RecordLocation::Document, "document", "", e.to_string())
    };
    if value.get("shapes").is_some() {
        let document: ToolDocument = serde_json::from_value(value).map_err(malformed)?;
        document
            .shapes
            .into_iter()
            .enumerate()
            .map(|(index, shape)| tool_shape_record(config, shape, RecordLocation::Entry(index), want))
            .collect()
    } else if value.get("annotations").is_some() {
        let document: CocoFile = serde_json::from_value(value).map_err(malformed)?;
        document
            .annotations
            .iter()
            .enumerate()
            .map(|(index, annotation)| {
                coco_record(config, &document, annotation, RecordLocation::Entry(index), want)
            })
            .collect()
    } else {
        Err(AnnotationError::schema(
            RecordLocation::Document,
            "annotations",
            "",
            "expected a CVAT shape document (`shapes`) or a COCO document (`annotations`)",
        ))
    }
}

/// Structured keypoint input as a record sequence.
pub fn keypoint_records_from_json<'a, R: Read>(
    reader: R,
    config: &'a ConversionConfig,
) -> Result<RecordIter<'a, RawKeypointRecord>> {
    let shapes = records_from_json(reader, config, Some(Pass::Keypoints))?;
    Ok(Box::new(shapes.into_iter().map(|shape| match shape {
        RawShape::Keypoints(record) => Ok(record),
        RawShape::Box(record) => Err(unexpected_shape(record.location, Pass::Keypoints)),
    })))
}

/// Structured box input as a record sequence.
pub fn box_records_from_json<'a, R: Read>(
    reader: R,
    config: &'a ConversionConfig,
) -> Result<RecordIter<'a, RawBoxRecord>> {
    let shapes = records_from_json(reader, config, Some(Pass::Bbox))?;
    Ok(Box::new(shapes.into_iter().map(|shape| match shape {
        RawShape::Box(record) => Ok(record),
        RawShape::Keypoints(record) => Err(unexpected_shape(record.location, Pass::Bbox)),
    })))
}

fn unexpected_shape(location: RecordLocation, want: Pass) -> AnnotationError {
    AnnotationError::schema(
        location,
        "type",
        "",
        format!("expected a {} shape", want),
    )
}

fn tool_shape_record(
    config: &ConversionConfig,
    shape: ToolShape,
    location: RecordLocation,
    want: Option<Pass>,
) -> Result<RawShape> {
    let frame = frame_in_range(config, shape.frame, "frame", &location)?;
    let label = check_label(config, &shape.label, "label", &location)?;
    let pass = match shape.shape_type {
        ShapeType::Skeleton => Pass::Keypoints,
        ShapeType::Rectangle => Pass::Bbox,
    };
    if let Some(want) = want.filter(|want| *want != pass) {
        return Err(unexpected_shape(location, want));
    }

    match pass {
        Pass::Keypoints => {
            let points = shape
                .elements
                .into_iter()
                .map(|element| match element.points[..] {
                    [x, y] => Ok(RawPoint {
                        point: PointRef::Name(element.label),
                        x,
                        y,
                        outside: element.outside || shape.outside,
                        occluded: element.occluded,
                    }),
                    _ => Err(AnnotationError::schema(
                        location.clone(),
                        format!("elements[{}].points", element.label),
                        format!("{:?}", element.points),
                        "a skeleton element needs exactly one (x, y) pair",
                    )),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(RawShape::Keypoints(RawKeypointRecord {
                location,
                frame,
                track: shape.track_id,
                label,
                points,
            }))
        }
        Pass::Bbox => match shape.points[..] {
            [x1, y1, x2, y2] => Ok(RawShape::Box(RawBoxRecord {
                location,
                frame,
                track: shape.track_id,
                label,
                x1,
                y1,
                x2,
                y2,
                outside: shape.outside,
                occluded: shape.occluded,
            })),
            _ => Err(AnnotationError::schema(
                location,
                "points",
                format!("{:?}", shape.points),
                "a rectangle needs exactly [xtl, ytl, xbr, ybr]",
            )),
        },
    }
}

fn coco_record(
    config: &ConversionConfig,
    document: &CocoFile,
    annotation: &Annotation,
    location: RecordLocation,
    want: Option<Pass>,
) -> Result<RawShape> {
    let frame = frame_in_range(config, document.frame_of(annotation.image_id), "image_id", &location)?;
    let track = annotation.track();
    let label = match document.category_name(annotation.category_id) {
        Some(name) => check_label(config, name, "category_id", &location)?,
        None if document.categories.is_empty() => config.skeleton.label.clone(),
        None => {
            return Err(AnnotationError::schema(
                location,
                "category_id",
                annotation.category_id.to_string(),
                "category is not declared in the document",
            ))
        }
    };
    let pass = want.unwrap_or(if annotation.has_keypoints() {
        Pass::Keypoints
    } else {
        Pass::Bbox
    });
    let attributes = annotation.attributes.clone().unwrap_or_default();

    match pass {
        Pass::Keypoints => {
            let keypoints = annotation
                .keypoints
                .as_deref()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    AnnotationError::schema(
                        location.clone(),
                        "keypoints",
                        "",
                        "annotation has no keypoints",
                    )
                })?;
            if keypoints.len() % 3 != 0 {
                return Err(AnnotationError::schema(
                    location,
                    "keypoints",
                    keypoints.len().to_string(),
                    "keypoints must be (x, y, visibility) triplets",
                ));
            }
            let points = keypoints
                .chunks_exact(3)
                .enumerate()
                .map(|(index, triplet)| RawPoint {
                    point: PointRef::Index(index),
                    x: triplet[0],
                    y: triplet[1],
                    outside: triplet[2] <= 0.0,
                    occluded: triplet[2] > 0.0 && triplet[2] < 2.0,
                })
                .collect();
            Ok(RawShape::Keypoints(RawKeypointRecord {
                location,
                frame,
                track,
                label,
                points,
            }))
        }
        Pass::Bbox => match annotation.bbox.as_deref() {
            Some(&[x, y, width, height]) => Ok(RawShape::Box(RawBoxRecord {
                location,
                frame,
                track,
                label,
                x1: x,
                y1: y,
                x2: x + width,
                y2: y + height,
                outside: attributes.outside.unwrap_or(false),
                occluded: attributes.occluded.unwrap_or(false),
            })),
            other => Err(AnnotationError::schema(
                location,
                "bbox",
                format!("{:?}", other),
                "bbox must be [x, y, width, height]",
            )),
        },
    }
}
