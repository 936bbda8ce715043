use serde::{Deserialize, Serialize};

use crate::coords::GeoPoint;
use crate::error::{Result, SdmError};
use crate::occurrence::ObservationPoint;
use crate::sampler::BackgroundPoint;

/// One row of the merged presence/background set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledPoint {
    /// Sequential id starting at 1.
    pub id: usize,
    /// 1 = presence, 0 = background.
    pub label: u8,
    pub lon: f64,
    pub lat: f64,
    /// Source record key for presences.
    pub source_key: Option<String>,
}

impl LabeledPoint {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lon, self.lat)
    }

    pub fn is_presence(&self) -> bool {
        self.label == 1
    }
}

/// Presences first, then background points; ids 1..=n in that order.
pub fn merge_points(observations: &[ObservationPoint], background: &[BackgroundPoint]) -> Result<Vec<LabeledPoint>> {
    if observations.len() != background.len() {
        return Err(SdmError::CountMismatch {
            presences: observations.len(),
            background: background.len(),
        });
    }
    let presences = observations.iter().map(|o| (1u8, o.lon, o.lat, Some(o.key.clone())));
    let absences = background.iter().map(|b| (0u8, b.lon, b.lat, None));
    Ok(presences
        .chain(absences)
        .enumerate()
        .map(|(i, (label, lon, lat, source_key))| LabeledPoint { id: i + 1, label, lon, lat, source_key })
        .collect())
}

/// (presences, background) counts.
pub fn class_counts(points: &[LabeledPoint]) -> (usize, usize) {
    let pres = points.iter().filter(|p| p.is_presence()).count();
    (pres, points.len() - pres)
}

/// Check the set invariants on a reloaded artifact: binary labels, ids 1..=n in order.
pub fn validate(points: &[LabeledPoint]) -> std::result::Result<(), String> {
    for (i, p) in points.iter().enumerate() {
        if p.id != i + 1 {
            return Err(format!("row {i} has id {} (ids must be 1..={} in order)", p.id, points.len()));
        }
        if p.label > 1 {
            return Err(format!("id {} has non-binary label {}", p.id, p.label));
        }
    }
    Ok(())
}
