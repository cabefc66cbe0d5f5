//! COCO format data structures and utilities
//!
//! CVAT exports corrected annotations as COCO Keypoints 1.0 / COCO 1.0
//! documents, and downstream tracking pipelines expect COCO as well. The
//! structures here read those exports leniently (unknown fields are ignored)
//! and write converted or merged records back out.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::config::ConversionConfig;
use crate::types::{AnnotationRecord, BoundingBox, CombinedRecord, Frame, KeypointSet, Shape, TrackId};

/// COCO dataset information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Info {
    pub year: String,
    pub version: String,
    pub description: String,
    pub contributor: String,
    pub url: String,
    pub date_created: String,
}

/// COCO license information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct License {
    pub id: u32,
    pub name: String,
    pub url: String,
}

/// COCO category information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub supercategory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skeleton: Option<Vec<[usize; 2]>>,
}

/// COCO image information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_index: Option<i64>,
}

impl Image {
    pub fn for_frame(frame: Frame, config: &ConversionConfig) -> Self {
        let (width, height) = config
            .image_size
            .map(|size| (size.width, size.height))
            .unwrap_or((0, 0));
        Self {
            id: frame.0 as i64,
            file_name: format!("{:04}.jpg", frame.0),
            width,
            height,
            frame_id: Some(frame.0 as i64),
            frame_index: None,
        }
    }

    /// Frame this image stands for: an explicit frame field, then the
    /// trailing digits of the file name (`frame_000012.jpg`), then the id.
    ///
    /// CVAT numbers images from 1 while frames start at 0, so the id is only
    /// a last resort.
    pub fn frame(&self) -> i64 {
        self.frame_id
            .or(self.frame_index)
            .or_else(|| frame_from_file_name(&self.file_name))
            .unwrap_or(self.id)
    }
}

fn frame_from_file_name(file_name: &str) -> Option<i64> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    let digits = stem.len() - stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    stem[stem.len() - digits..].parse().ok()
}

/// Per-shape attributes CVAT attaches to exported annotations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<TrackId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occluded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outside: Option<bool>,
}

/// COCO annotation information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub id: u64,
    pub image_id: i64,
    #[serde(default)]
    pub category_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Vec<f64>>, // [x, y, width, height]
    #[serde(default)]
    pub area: f64,
    #[serde(default)]
    pub iscrowd: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<Vec<f64>>, // [x0, y0, v0, x1, y1, v1, ...]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_keypoints: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<TrackId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<TrackId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
}

impl Annotation {
    /// Track of this annotation: `track_id`, then the CVAT attribute, then
    /// `instance_id`, then the annotation id itself.
    pub fn track(&self) -> TrackId {
        self.track_id
            .clone()
            .or_else(|| self.attributes.as_ref().and_then(|a| a.track_id.clone()))
            .or_else(|| self.instance_id.clone())
            .unwrap_or(TrackId::Numeric(self.id))
    }

    pub fn has_keypoints(&self) -> bool {
        self.keypoints.as_ref().is_some_and(|k| !k.is_empty())
    }
}

/// Complete COCO dataset structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoFile {
    #[serde(default, skip_deserializing)]
    pub info: Info,
    #[serde(default, skip_deserializing)]
    pub licenses: Vec<License>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl Default for CocoFile {
    fn default() -> Self {
        Self {
            info: Info::default(),
            licenses: vec![License::default()],
            categories: Vec::new(),
            images: Vec::new(),
            annotations: Vec::new(),
        }
    }
}

impl CocoFile {
    /// Frame of an `image_id`, falling back to the id itself when the image
    /// list does not mention it.
    pub fn frame_of(&self, image_id: i64) -> i64 {
        self.images
            .iter()
            .find(|image| image.id == image_id)
            .map(Image::frame)
            .unwrap_or(image_id)
    }

    pub fn category_name(&self, category_id: u64) -> Option<&str> {
        self.categories
            .iter()
            .find(|c| c.id == category_id)
            .map(|c| c.name.as_str())
    }
}

/// One category per label (1-based ids); the skeleton label carries the topology.
pub fn categories(config: &ConversionConfig) -> Vec<Category> {
    config
        .label_set()
        .into_iter()
        .enumerate()
        .map(|(index, name)| {
            let is_skeleton = name == config.skeleton.label;
            Category {
                id: (index + 1) as u64,
                name: name.to_string(),
                supercategory: "object".to_string(),
                keypoints: is_skeleton.then(|| config.skeleton.points.clone()),
                skeleton: is_skeleton.then(|| config.skeleton.coco_links()),
            }
        })
        .collect()
}

fn category_id(config: &ConversionConfig, label: &str) -> u64 {
    config
        .label_set()
        .iter()
        .position(|l| *l == label)
        .map(|index| (index + 1) as u64)
        .unwrap_or(0)
}

/// COCO keypoint triplets: outside → `0, 0, 0`, occluded → `v = 1`, visible → `v = 2`.
pub fn keypoint_triplets(set: &KeypointSet) -> Vec<f64> {
    set.points
        .iter()
        .flat_map(|p| match (p.outside, p.occluded) {
            (true, _) => [0.0, 0.0, 0.0],
            (false, true) => [p.x, p.y, 1.0],
            (false, false) => [p.x, p.y, 2.0],
        })
        .collect()
}

/// Calculate bounding box from the visible points of a skeleton
pub fn calculate_bbox_from_keypoints(set: &KeypointSet) -> [f64; 4] {
    let mut visible = set.visible().peekable();
    if visible.peek().is_none() {
        return [0.0, 0.0, 0.0, 0.0];
    }

    let mut min_x = f64::MAX;
    let mut min_y = f64::MAX;
    let mut max_x = f64::MIN;
    let mut max_y = f64::MIN;

    for point in visible {
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }

    [min_x, min_y, max_x - min_x, max_y - min_y]
}

fn keypoint_annotation(
    id: u64,
    record_frame: Frame,
    track: &TrackId,
    category_id: u64,
    set: &KeypointSet,
) -> Annotation {
    let bbox = calculate_bbox_from_keypoints(set);
    Annotation {
        id,
        image_id: record_frame.0 as i64,
        category_id,
        bbox: Some(bbox.to_vec()),
        area: bbox[2] * bbox[3],
        iscrowd: 0,
        keypoints: Some(keypoint_triplets(set)),
        num_keypoints: Some(set.visible().count()),
        track_id: Some(track.clone()),
        instance_id: None,
        attributes: None,
    }
}

fn box_annotation(
    id: u64,
    record_frame: Frame,
    track: &TrackId,
    category_id: u64,
    bbox: &BoundingBox,
) -> Annotation {
    Annotation {
        id,
        image_id: record_frame.0 as i64,
        category_id,
        bbox: Some(bbox.to_xywh().to_vec()),
        area: bbox.area(),
        iscrowd: 0,
        keypoints: None,
        num_keypoints: None,
        track_id: Some(track.clone()),
        instance_id: None,
        attributes: Some(Attributes {
            track_id: None,
            occluded: Some(bbox.occluded),
            outside: Some(bbox.outside),
        }),
    }
}

fn images_for(frames: BTreeSet<Frame>, config: &ConversionConfig) -> Vec<Image> {
    frames
        .into_iter()
        .map(|frame| Image::for_frame(frame, config))
        .collect()
}

/// COCO Keypoints 1.0 / COCO 1.0 document for mapped records.
pub fn records_to_coco(records: &[AnnotationRecord], config: &ConversionConfig) -> CocoFile {
    let frames: BTreeSet<Frame> = records.iter().map(|r| r.frame).collect();
    let annotations = records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let id = (index + 1) as u64;
            let category_id = category_id(config, &record.label);
            match &record.shape {
                Shape::Skeleton(set) => {
                    keypoint_annotation(id, record.frame, &record.track, category_id, set)
                }
                Shape::Rectangle(bbox) => {
                    box_annotation(id, record.frame, &record.track, category_id, bbox)
                }
            }
        })
        .collect();

    CocoFile {
        categories: categories(config),
        images: images_for(frames, config),
        annotations,
        ..CocoFile::default()
    }
}

/// COCO document for merged records. Each annotation carries whichever of
/// `keypoints` and `bbox` the record has; an absent shape is omitted.
pub fn combined_to_coco(records: &[CombinedRecord], config: &ConversionConfig) -> CocoFile {
    let frames: BTreeSet<Frame> = records.iter().map(|r| r.frame).collect();
    let annotations = records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let id = (index + 1) as u64;
            let category_id = category_id(config, &record.label);
            let mut annotation = match &record.bbox {
                Some(bbox) => box_annotation(id, record.frame, &record.track, category_id, bbox),
                None => Annotation {
                    id,
                    image_id: record.frame.0 as i64,
                    category_id,
                    bbox: None,
                    area: 0.0,
                    iscrowd: 0,
                    keypoints: None,
                    num_keypoints: None,
                    track_id: Some(record.track.clone()),
                    instance_id: None,
                    attributes: None,
                },
            };
            if let Some(set) = &record.keypoints {
                annotation.keypoints = Some(keypoint_triplets(set));
                annotation.num_keypoints = Some(set.visible().count());
            }
            annotation
        })
        .collect();

    CocoFile {
        categories: categories(config),
        images: images_for(frames, config),
        annotations,
        ..CocoFile::default()
    }
}
