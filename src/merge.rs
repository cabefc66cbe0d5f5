//! Merge Engine: joins a corrected keypoint export with a corrected box
//! export on (frame, track).
//!
//! Records are routed by their shape, not by which argument they came in, and
//! both sides are indexed in ordered maps before anything is emitted. The
//! result is a keyed union ordered by (frame, track) that does not depend on
//! argument order or on the order of records inside either input.

use log::{debug, info};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::config::ConversionConfig;
use crate::error::{AnnotationError, Result};
use crate::identity::IdentityCorrelator;
use crate::types::{AnnotationRecord, CombinedRecord, JoinKey, Shape};
use crate::validate::check_record;

/// Counts of how keys were joined.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub matched: usize,
    pub keypoints_only: usize,
    pub boxes_only: usize,
}

impl MergeSummary {
    pub fn print_summary(&self) {
        info!("=== Merge Summary ===");
        info!("Keypoints and box: {}", self.matched);
        info!("Keypoints without box: {}", self.keypoints_only);
        info!("Box without keypoints: {}", self.boxes_only);
    }
}

#[derive(Default)]
struct ShapeIndex {
    skeletons: BTreeMap<JoinKey, AnnotationRecord>,
    boxes: BTreeMap<JoinKey, AnnotationRecord>,
}

impl ShapeIndex {
    fn insert(&mut self, record: AnnotationRecord) -> Result<()> {
        let pass = record.pass();
        let index = match &record.shape {
            Shape::Skeleton(_) => &mut self.skeletons,
            Shape::Rectangle(_) => &mut self.boxes,
        };
        match index.entry(record.key()) {
            Entry::Occupied(entry) => Err(AnnotationError::duplicate(pass, entry.key())),
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(())
            }
        }
    }
}

/// Merge two validated record sets into combined records.
pub fn merge(
    first: Vec<AnnotationRecord>,
    second: Vec<AnnotationRecord>,
    config: &ConversionConfig,
) -> Result<Vec<CombinedRecord>> {
    merge_with_summary(first, second, config).map(|(records, _)| records)
}

pub fn merge_with_summary(
    first: Vec<AnnotationRecord>,
    second: Vec<AnnotationRecord>,
    config: &ConversionConfig,
) -> Result<(Vec<CombinedRecord>, MergeSummary)> {
    let correlator = IdentityCorrelator::new();
    let mut index = ShapeIndex::default();
    for record in first.into_iter().chain(second) {
        check_record(config, &record)?;
        correlator.observe_record(&record)?;
        index.insert(record)?;
    }

    let mut summary = MergeSummary::default();
    let mut combined: BTreeMap<JoinKey, CombinedRecord> = BTreeMap::new();
    let ShapeIndex {
        skeletons,
        mut boxes,
    } = index;

    for (key, record) in skeletons {
        let bbox = boxes.remove(&key).and_then(|b| match b.shape {
            Shape::Rectangle(bbox) => Some(bbox),
            Shape::Skeleton(_) => None,
        });
        if bbox.is_some() {
            summary.matched += 1;
        } else {
            debug!("No box for {}", key);
            summary.keypoints_only += 1;
        }
        let keypoints = match record.shape {
            Shape::Skeleton(set) => Some(set),
            Shape::Rectangle(_) => None,
        };
        combined.insert(
            key,
            CombinedRecord {
                frame: record.frame,
                track: record.track,
                label: record.label,
                keypoints,
                bbox,
            },
        );
    }

    for (key, record) in boxes {
        debug!("No keypoints for {}", key);
        summary.boxes_only += 1;
        let bbox = match record.shape {
            Shape::Rectangle(bbox) => Some(bbox),
            Shape::Skeleton(_) => None,
        };
        combined.insert(
            key,
            CombinedRecord {
                frame: record.frame,
                track: record.track,
                label: record.label,
                keypoints: None,
                bbox,
            },
        );
    }

    info!(
        "Merged {} records across {} tracks",
        combined.len(),
        correlator.track_count()
    );
    Ok((combined.into_values().collect(), summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::types::{BoundingBox, Frame, Keypoint, KeypointSet, Pass, Point, TrackId};
    use assert_matches::assert_matches;

    fn skeleton(frame: u64, track: &str) -> AnnotationRecord {
        let config = test_config();
        let points = config
            .skeleton
            .points
            .iter()
            .enumerate()
            .map(|(index, name)| Keypoint {
                index,
                name: name.clone(),
                x: index as f64 + frame as f64,
                y: 2.0 * index as f64,
                outside: false,
                occluded: index == 2,
            })
            .collect();
        AnnotationRecord {
            frame: Frame(frame),
            track: TrackId::from(track),
            label: "mouse".to_string(),
            shape: Shape::Skeleton(KeypointSet { points }),
        }
    }

    fn rectangle(frame: u64, track: &str) -> AnnotationRecord {
        AnnotationRecord {
            frame: Frame(frame),
            track: TrackId::from(track),
            label: "mouse".to_string(),
            shape: Shape::Rectangle(BoundingBox {
                top_left: Point::new(1.0, 2.0),
                bottom_right: Point::new(30.0, 40.0),
                outside: false,
                occluded: false,
            }),
        }
    }

    #[test]
    fn test_merge_is_commutative() {
        let config = test_config();
        let keypoints = vec![skeleton(2, "A"), skeleton(1, "10"), skeleton(1, "2")];
        let boxes = vec![rectangle(1, "2"), rectangle(5, "A")];
        let forward = merge(keypoints.clone(), boxes.clone(), &config).unwrap();
        let backward = merge(boxes, keypoints, &config).unwrap();
        assert_eq!(forward, backward);

        let keys: Vec<_> = forward.iter().map(CombinedRecord::key).collect();
        assert_eq!(
            keys,
            vec![
                JoinKey::new(Frame(1), TrackId::from(2)),
                JoinKey::new(Frame(1), TrackId::from(10)),
                JoinKey::new(Frame(2), TrackId::from("A")),
                JoinKey::new(Frame(5), TrackId::from("A")),
            ]
        );
    }

    #[test]
    fn test_repeated_merges_serialize_identically() {
        let config = test_config();
        let run = || {
            let records = merge(
                vec![skeleton(3, "7"), skeleton(0, "B")],
                vec![rectangle(3, "7")],
                &config,
            )
            .unwrap();
            serde_json::to_vec(&records).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_split_reproduces_inputs() {
        let config = test_config();
        let (kp, bb) = (skeleton(4, "A"), rectangle(4, "A"));
        let merged = merge(vec![kp.clone()], vec![bb.clone()], &config).unwrap();
        assert_eq!(merged.len(), 1);
        let (split_kp, split_bb) = merged[0].clone().split();
        assert_eq!(split_kp, Some(kp));
        assert_eq!(split_bb, Some(bb));
    }

    #[test]
    fn test_duplicates_within_a_kind() {
        let config = test_config();
        assert_matches!(
            merge(vec![], vec![rectangle(1, "X"), rectangle(1, "X")], &config),
            Err(AnnotationError::DuplicateKey { pass: Pass::Bbox, .. })
        );
        // The same skeleton arriving from both sides is also a duplicate.
        assert_matches!(
            merge(vec![skeleton(1, "X")], vec![skeleton(1, "X")], &config),
            Err(AnnotationError::DuplicateKey { pass: Pass::Keypoints, .. })
        );
    }

    #[test]
    fn test_label_must_agree_across_exports() {
        let config = test_config();
        let mut bb = rectangle(6, "A");
        bb.label = "rat".to_string();
        assert_matches!(
            merge(vec![skeleton(5, "A")], vec![bb], &config),
            Err(AnnotationError::TrackLabelConflict { expected, found, .. })
                if expected == "mouse" && found == "rat"
        );
    }

    #[test]
    fn test_summary_counts() {
        let config = test_config();
        let (_, summary) = merge_with_summary(
            vec![skeleton(1, "A"), skeleton(2, "A")],
            vec![rectangle(2, "A"), rectangle(3, "A")],
            &config,
        )
        .unwrap();
        assert_eq!(
            summary,
            MergeSummary {
                matched: 1,
                keypoints_only: 1,
                boxes_only: 1
            }
        );
    }
}
