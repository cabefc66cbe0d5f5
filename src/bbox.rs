//! BBox Mapper: raw box rows to rectangle records.

use log::{info, warn};
use std::collections::BTreeMap;

use crate::coco::calculate_bbox_from_keypoints;
use crate::config::ConversionConfig;
use crate::error::{AnnotationError, Result};
use crate::identity::IdentityCorrelator;
use crate::parser::RawBoxRecord;
use crate::types::{
    AnnotationRecord, BoundingBox, ConversionStats, Correction, JoinKey, Pass, Point, Shape,
};
use crate::validate::check_record;

/// Put the corners of a box in top-left / bottom-right order.
///
/// Applying it to its own output returns the box unchanged with no correction.
pub fn normalize(bbox: BoundingBox, key: &JoinKey) -> (BoundingBox, Option<Correction>) {
    let swapped_x = bbox.top_left.x > bbox.bottom_right.x;
    let swapped_y = bbox.top_left.y > bbox.bottom_right.y;
    if !swapped_x && !swapped_y {
        return (bbox, None);
    }

    let (left, right) = (
        bbox.top_left.x.min(bbox.bottom_right.x),
        bbox.top_left.x.max(bbox.bottom_right.x),
    );
    let (top, bottom) = (
        bbox.top_left.y.min(bbox.bottom_right.y),
        bbox.top_left.y.max(bbox.bottom_right.y),
    );
    let normalized = BoundingBox {
        top_left: Point::new(left, top),
        bottom_right: Point::new(right, bottom),
        ..bbox
    };
    let correction = Correction {
        key: key.clone(),
        swapped_x,
        swapped_y,
    };
    (normalized, Some(correction))
}

pub struct BoxMapper<'a> {
    config: &'a ConversionConfig,
}

impl<'a> BoxMapper<'a> {
    pub fn new(config: &'a ConversionConfig) -> Self {
        Self { config }
    }

    /// Map one raw box. Inverted corners are swapped and reported.
    pub fn map_one(&self, raw: RawBoxRecord) -> Result<(AnnotationRecord, Option<Correction>)> {
        let key = JoinKey::new(raw.frame, raw.track.clone());
        let (x1, y1) = self.config.to_pixels(raw.x1, raw.y1);
        let (x2, y2) = self.config.to_pixels(raw.x2, raw.y2);
        let (bbox, correction) = normalize(
            BoundingBox {
                top_left: Point::new(x1, y1),
                bottom_right: Point::new(x2, y2),
                outside: raw.outside,
                occluded: raw.occluded,
            },
            &key,
        );
        if let Some(correction) = &correction {
            warn!("Corrected box at {}: {}", raw.location, correction);
        }

        let record = AnnotationRecord {
            frame: raw.frame,
            track: raw.track,
            label: raw.label,
            shape: Shape::Rectangle(bbox),
        };
        check_record(self.config, &record)?;
        Ok((record, correction))
    }

    /// Map every raw box; a second box for the same key is an error.
    ///
    /// The output is ordered by (frame, track).
    pub fn map_all<I>(
        &self,
        raw: I,
        correlator: &IdentityCorrelator,
        stats: &mut ConversionStats,
    ) -> Result<Vec<AnnotationRecord>>
    where
        I: IntoIterator<Item = Result<RawBoxRecord>>,
    {
        let mut mapped: BTreeMap<JoinKey, AnnotationRecord> = BTreeMap::new();
        for record in raw {
            let record = record?;
            stats.records_read += 1;
            let key = correlator.observe(record.frame, &record.track, &record.label)?;
            if mapped.contains_key(&key) {
                return Err(AnnotationError::duplicate(Pass::Bbox, &key));
            }
            let (record, correction) = self.map_one(record)?;
            if correction.is_some() {
                stats.corrections += 1;
            }
            mapped.insert(key, record);
        }
        info!("Mapped {} boxes", mapped.len());
        stats.records_emitted += mapped.len();
        Ok(mapped.into_values().collect())
    }
}

/// Boxes spanning the points of each skeleton that are not outside.
///
/// A skeleton whose visible points do not span a positive width and height
/// gets no box.
pub fn derive_from_keypoints(
    records: &[AnnotationRecord],
    stats: &mut ConversionStats,
) -> Vec<AnnotationRecord> {
    let mut derived = Vec::with_capacity(records.len());
    for record in records {
        let Shape::Skeleton(set) = &record.shape else {
            continue;
        };
        let [x, y, width, height] = calculate_bbox_from_keypoints(set);
        if width <= 0.0 || height <= 0.0 {
            warn!(
                "No box derived for {}: visible points span {}x{}",
                record.key(),
                width,
                height
            );
            stats.shapes_skipped += 1;
            continue;
        }
        derived.push(AnnotationRecord {
            frame: record.frame,
            track: record.track.clone(),
            label: record.label.clone(),
            shape: Shape::Rectangle(BoundingBox {
                top_left: Point::new(x, y),
                bottom_right: Point::new(x + width, y + height),
                outside: false,
                occluded: false,
            }),
        });
    }
    stats.records_emitted += derived.len();
    derived
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_config, ConversionConfig, CoordinateUnits, ImageSize};
    use crate::parser::box_records_from_csv;
    use crate::error::RecordLocation;
    use crate::types::{Frame, Keypoint, KeypointSet, TrackId};
    use assert_matches::assert_matches;

    fn raw(track: &str, corners: (f64, f64, f64, f64)) -> RawBoxRecord {
        RawBoxRecord {
            location: RecordLocation::Line(2),
            frame: Frame(1),
            track: TrackId::from(track),
            label: "mouse".to_string(),
            x1: corners.0,
            y1: corners.1,
            x2: corners.2,
            y2: corners.3,
            outside: false,
            occluded: false,
        }
    }

    #[test]
    fn test_inverted_corners_are_swapped() {
        let config = test_config();
        let (record, correction) = BoxMapper::new(&config)
            .map_one(raw("X", (50.0, 50.0, 10.0, 10.0)))
            .unwrap();
        let Shape::Rectangle(bbox) = record.shape else {
            panic!("expected a rectangle");
        };
        assert_eq!(bbox.top_left, Point::new(10.0, 10.0));
        assert_eq!(bbox.bottom_right, Point::new(50.0, 50.0));
        let correction = correction.unwrap();
        assert!(correction.swapped_x && correction.swapped_y);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let key = JoinKey::new(Frame(0), TrackId::from(1));
        let inverted = BoundingBox {
            top_left: Point::new(8.0, 1.0),
            bottom_right: Point::new(2.0, 9.0),
            outside: false,
            occluded: true,
        };
        let (once, correction) = normalize(inverted, &key);
        assert_matches!(correction, Some(Correction { swapped_x: true, swapped_y: false, .. }));
        let (twice, again) = normalize(once, &key);
        assert_eq!(once, twice);
        assert!(again.is_none());
        assert!(twice.occluded);
    }

    #[test]
    fn test_degenerate_and_duplicate_boxes() {
        let config = test_config();
        let mapper = BoxMapper::new(&config);
        assert_matches!(
            mapper.map_one(raw("X", (5.0, 5.0, 5.0, 20.0))),
            Err(AnnotationError::DegenerateBox { .. })
        );

        let rows = vec![
            Ok(raw("X", (0.0, 0.0, 10.0, 10.0))),
            Ok(raw("X", (1.0, 1.0, 10.0, 10.0))),
        ];
        assert_matches!(
            mapper.map_all(rows, &IdentityCorrelator::new(), &mut ConversionStats::new()),
            Err(AnnotationError::DuplicateKey { pass: Pass::Bbox, frame: Frame(1), .. })
        );
    }

    #[test]
    fn test_derive_skips_collapsed_skeletons() {
        let config = test_config();
        let mut points: Vec<Keypoint> = config
            .skeleton
            .points
            .iter()
            .enumerate()
            .map(|(index, name)| Keypoint::absent(index, name))
            .collect();
        points[0] = Keypoint {
            x: 4.0,
            y: 4.0,
            outside: false,
            ..points[0].clone()
        };
        let single = AnnotationRecord {
            frame: Frame(0),
            track: TrackId::from(1),
            label: "mouse".to_string(),
            shape: Shape::Skeleton(KeypointSet {
                points: points.clone(),
            }),
        };
        points[4] = Keypoint {
            x: 14.0,
            y: 9.0,
            outside: false,
            ..points[4].clone()
        };
        let spread = AnnotationRecord {
            frame: Frame(1),
            shape: Shape::Skeleton(KeypointSet { points }),
            ..single.clone()
        };

        let mut stats = ConversionStats::new();
        let derived = derive_from_keypoints(&[single, spread], &mut stats);
        assert_eq!(derived.len(), 1);
        assert_eq!(stats.shapes_skipped, 1);
        assert_eq!(
            derived[0].shape,
            Shape::Rectangle(BoundingBox {
                top_left: Point::new(4.0, 4.0),
                bottom_right: Point::new(14.0, 9.0),
                outside: false,
                occluded: false,
            })
        );
    }

    #[test]
    fn test_normalized_rows_map_to_pixels() {
        let config = ConversionConfig {
            units: CoordinateUnits::Normalized,
            image_size: Some(ImageSize {
                width: 640,
                height: 480,
            }),
            ..test_config()
        };
        let raw = box_records_from_csv(
            "frame_id,track_id,x1,y1,x2,y2\n1,X,0.75,0.75,0.25,0.5\n".as_bytes(),
            b',',
            &config,
        )
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
        let (record, correction) = BoxMapper::new(&config).map_one(raw).unwrap();
        let Shape::Rectangle(bbox) = record.shape else {
            panic!("expected a rectangle");
        };
        assert_eq!(bbox.top_left, Point::new(160.0, 240.0));
        assert_eq!(bbox.bottom_right, Point::new(480.0, 360.0));
        assert!(correction.is_some());
    }
}
