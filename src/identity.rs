use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{AnnotationError, Result};
use crate::types::{AnnotationRecord, Frame, JoinKey, TrackId};

/// Where a track was first seen and with which label.
#[derive(Debug, Clone)]
struct FirstSighting {
    frame: Frame,
    label: String,
}

/// Verifies that every track keeps a single label across records and passes.
///
/// The correlator does not discover identities; track ids come from upstream
/// and are only checked for consistency. It can be shared between rayon
/// workers.
#[derive(Debug, Default)]
pub struct IdentityCorrelator {
    tracks: DashMap<TrackId, FirstSighting>,
}

impl IdentityCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of a track and return its join key.
    pub fn observe(&self, frame: Frame, track: &TrackId, label: &str) -> Result<JoinKey> {
        match self.tracks.entry(track.clone()) {
            Entry::Occupied(mut entry) => {
                let first = entry.get();
                if first.label != label {
                    // The earliest frame owns the expected label, whichever
                    // occurrence a worker reaches first.
                    let (frame, expected, found) = if first.frame <= frame {
                        (frame, first.label.clone(), label.to_string())
                    } else {
                        (first.frame, label.to_string(), first.label.clone())
                    };
                    return Err(AnnotationError::TrackLabelConflict {
                        track: track.clone(),
                        frame,
                        expected,
                        found,
                    });
                }
                if frame < first.frame {
                    entry.get_mut().frame = frame;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(FirstSighting {
                    frame,
                    label: label.to_string(),
                });
            }
        }
        Ok(JoinKey::new(frame, track.clone()))
    }

    pub fn observe_record(&self, record: &AnnotationRecord) -> Result<JoinKey> {
        self.observe(record.frame, &record.track, &record.label)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}
