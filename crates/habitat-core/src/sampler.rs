//! Pseudo-absence (background) sampling.

use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::coords::GeoPoint;
use crate::error::{Result, SdmError};
use crate::raster::RasterLayer;

/// A sampled stand-in for "not observed". Label 0; no source key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundPoint {
    pub lon: f64,
    pub lat: f64,
}

impl BackgroundPoint {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lon, self.lat)
    }
}

/// Rasterise `points` onto the layer's grid: true for every cell holding at least one point.
/// Points outside the extent are ignored.
pub fn occupancy_mask(reference: &RasterLayer, points: &[GeoPoint]) -> Vec<bool> {
    let g = reference.grid;
    let mut mask = vec![false; g.len()];
    for &p in points {
        if let Some((row, col)) = g.cell_of(p) {
            mask[g.index(row, col)] = true;
        }
    }
    mask
}

/// Draw `n` cell centres uniformly at random, without replacement, from cells that
/// hold a value in `reference` and are not marked in `occupied`.
///
/// Fails rather than under-sampling when fewer than `n` such cells exist.
pub fn sample_background<R: Rng + ?Sized>(
    reference: &RasterLayer,
    n: usize,
    occupied: &[bool],
    rng: &mut R,
) -> Result<Vec<BackgroundPoint>> {
    let g = reference.grid;
    debug_assert_eq!(occupied.len(), g.len());

    let candidates: Vec<usize> = (0..g.len())
        .filter(|&i| reference.data[i].is_finite() && !occupied[i])
        .collect();
    if candidates.len() < n {
        return Err(SdmError::InsufficientCells { requested: n, available: candidates.len() });
    }

    let picks = rand::seq::index::sample(rng, candidates.len(), n);
    let out: Vec<BackgroundPoint> = picks
        .into_iter()
        .map(|k| {
            let cell = candidates[k];
            let c = g.cell_center(cell / g.width, cell % g.width);
            BackgroundPoint { lon: c.lon, lat: c.lat }
        })
        .collect();

    info!("sampled {n} background points from {} eligible cells", candidates.len());
    Ok(out)
}
