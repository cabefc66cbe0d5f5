//! Keypoint Mapper: raw keypoint rows to full skeleton records.

use log::{debug, info};
use rayon::prelude::*;
use std::collections::BTreeMap;

use crate::config::ConversionConfig;
use crate::error::{AnnotationError, Result};
use crate::identity::IdentityCorrelator;
use crate::parser::{PointRef, RawKeypointRecord};
use crate::types::{AnnotationRecord, ConversionStats, JoinKey, Keypoint, KeypointSet, Shape};
use crate::utils::create_progress_bar;
use crate::validate::check_record;

pub struct KeypointMapper<'a> {
    config: &'a ConversionConfig,
}

impl<'a> KeypointMapper<'a> {
    pub fn new(config: &'a ConversionConfig) -> Self {
        Self { config }
    }

    fn slot(&self, key: &JoinKey, point: &PointRef) -> Result<usize> {
        let topology = &self.config.skeleton;
        let slot = match point {
            PointRef::Index(index) => Some(*index).filter(|i| *i < topology.len()),
            PointRef::Name(name) => topology.index_of(name),
        };
        slot.ok_or_else(|| AnnotationError::TopologyMismatch {
            frame: key.frame,
            track: key.track.clone(),
            point: point.to_string(),
        })
    }

    /// Build one skeleton from every raw row of a (frame, track) group.
    ///
    /// Slots no row defines are filled as outside.
    pub fn map_group(&self, key: &JoinKey, rows: &[RawKeypointRecord]) -> Result<AnnotationRecord> {
        let names = &self.config.skeleton.points;
        let mut slots: Vec<Option<Keypoint>> = vec![None; names.len()];

        for row in rows {
            for raw in &row.points {
                let index = self.slot(key, &raw.point)?;
                if slots[index].is_some() {
                    return Err(AnnotationError::schema(
                        row.location.clone(),
                        names[index].as_str(),
                        raw.point.to_string(),
                        format!("point is defined twice for {}", key),
                    ));
                }
                let (x, y) = self.config.to_pixels(raw.x, raw.y);
                slots[index] = Some(Keypoint {
                    index,
                    name: names[index].clone(),
                    x,
                    y,
                    outside: raw.outside,
                    occluded: raw.occluded && !raw.outside,
                });
            }
        }

        let points = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.unwrap_or_else(|| Keypoint::absent(index, &names[index])))
            .collect();
        let label = rows
            .first()
            .map(|row| row.label.clone())
            .unwrap_or_else(|| self.config.skeleton.label.clone());
        let record = AnnotationRecord {
            frame: key.frame,
            track: key.track.clone(),
            label,
            shape: Shape::Skeleton(KeypointSet { points }),
        };
        check_record(self.config, &record)?;
        debug!("Mapped skeleton for {}", key);
        Ok(record)
    }

    /// Map a record that is known to be the only one for its key.
    pub fn map_one(&self, raw: RawKeypointRecord) -> Result<AnnotationRecord> {
        let key = JoinKey::new(raw.frame, raw.track.clone());
        self.map_group(&key, std::slice::from_ref(&raw))
    }

    /// Group raw rows by key, check track labels, and map every group.
    ///
    /// The output is ordered by (frame, track).
    pub fn map_all<I>(
        &self,
        raw: I,
        correlator: &IdentityCorrelator,
        stats: &mut ConversionStats,
    ) -> Result<Vec<AnnotationRecord>>
    where
        I: IntoIterator<Item = Result<RawKeypointRecord>>,
    {
        let mut groups: BTreeMap<JoinKey, Vec<RawKeypointRecord>> = BTreeMap::new();
        for record in raw {
            let record = record?;
            stats.records_read += 1;
            let key = correlator.observe(record.frame, &record.track, &record.label)?;
            groups.entry(key).or_default().push(record);
        }
        info!(
            "Mapping {} keypoint groups onto skeleton {:?}",
            groups.len(),
            self.config.skeleton.label
        );

        let groups: Vec<(JoinKey, Vec<RawKeypointRecord>)> = groups.into_iter().collect();
        let pb = create_progress_bar(groups.len() as u64, "Keypoints");
        let records = groups
            .par_iter()
            .map(|(key, rows)| {
                let record = self.map_group(key, rows);
                pb.inc(1);
                record
            })
            .collect::<Result<Vec<_>>>();
        pb.finish_and_clear();
        let records = records?;

        stats.records_emitted += records.len();
        stats.points_marked_outside += records
            .iter()
            .filter_map(|record| match &record.shape {
                Shape::Skeleton(set) => Some(set.points.iter().filter(|p| p.outside).count()),
                Shape::Rectangle(_) => None,
            })
            .sum::<usize>();
        Ok(records)
    }
}
