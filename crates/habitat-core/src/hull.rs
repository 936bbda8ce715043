//! Study-area delineation: convex hull of the presences, then crop + mask of the stack.

use log::info;
use serde::{Deserialize, Serialize};

use crate::coords::{BBox, GeoPoint};
use crate::error::{Result, SdmError};
use crate::raster::RasterStack;

/// Counter-clockwise hull ring, first vertex not repeated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvexHull {
    pub vertices: Vec<GeoPoint>,
}

fn cross(o: GeoPoint, a: GeoPoint, b: GeoPoint) -> f64 {
    (a.lon - o.lon) * (b.lat - o.lat) - (a.lat - o.lat) * (b.lon - o.lon)
}

impl ConvexHull {
    /// Andrew's monotone chain. Needs at least three distinct, non-collinear points.
    pub fn from_points(points: &[GeoPoint]) -> Result<Self> {
        let mut pts: Vec<GeoPoint> = points.iter().copied().filter(GeoPoint::is_finite).collect();
        pts.sort_by(|a, b| a.lon.total_cmp(&b.lon).then(a.lat.total_cmp(&b.lat)));
        pts.dedup();
        if pts.len() < 3 {
            return Err(SdmError::DegenerateHull { points: pts.len() });
        }

        let mut lower: Vec<GeoPoint> = Vec::with_capacity(pts.len());
        for &p in &pts {
            while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
                lower.pop();
            }
            lower.push(p);
        }
        let mut upper: Vec<GeoPoint> = Vec::with_capacity(pts.len());
        for &p in pts.iter().rev() {
            while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
                upper.pop();
            }
            upper.push(p);
        }
        lower.pop();
        upper.pop();
        lower.extend(upper);

        if lower.len() < 3 {
            return Err(SdmError::DegenerateHull { points: pts.len() });
        }
        Ok(Self { vertices: lower })
    }

    /// None only for a hull reloaded without vertices.
    pub fn bbox(&self) -> Option<BBox> {
        BBox::enclosing(&self.vertices)
    }

    /// Inclusive point-in-polygon test (boundary counts as inside).
    pub fn contains(&self, p: GeoPoint) -> bool {
        let n = self.vertices.len();
        let scale = self
            .vertices
            .iter()
            .fold(1.0f64, |m, v| m.max(v.lon.abs()).max(v.lat.abs()));
        let eps = 1e-12 * scale * scale;
        (0..n).all(|i| cross(self.vertices[i], self.vertices[(i + 1) % n], p) >= -eps)
    }

    /// Shoelace area in square degrees.
    pub fn area(&self) -> f64 {
        let n = self.vertices.len();
        let twice: f64 = (0..n)
            .map(|i| {
                let (a, b) = (self.vertices[i], self.vertices[(i + 1) % n]);
                a.lon * b.lat - b.lon * a.lat
            })
            .sum();
        twice.abs() / 2.0
    }
}

/// Crop the stack to the hull's bounding box, then blank cells outside the hull.
///
/// A cell is kept when its centre lies inside the hull or when it contains one of
/// `presences`; otherwise presences on hull vertices would lose their own cell.
pub fn clip_to_hull(stack: &RasterStack, hull: &ConvexHull, presences: &[GeoPoint]) -> Result<RasterStack> {
    let g = stack.grid;
    let bb = hull.bbox().ok_or(SdmError::DegenerateHull { points: hull.vertices.len() })?;
    if !g.bbox().overlaps(&bb) {
        return Err(SdmError::GridMismatch {
            name: "study area".into(),
            detail: format!("hull {bb:?} does not intersect raster extent {:?}", g.bbox()),
        });
    }

    // Cell-aligned window covering the box, clamped to the raster.
    let col0 = (((bb.min_lon - g.west) / g.cell_width).floor().max(0.0) as usize).min(g.width - 1);
    let col1 = (((bb.max_lon - g.west) / g.cell_width).ceil().max(1.0) as usize).min(g.width);
    let row0 = (((g.north - bb.max_lat) / g.cell_height).floor().max(0.0) as usize).min(g.height - 1);
    let row1 = (((g.north - bb.min_lat) / g.cell_height).ceil().max(1.0) as usize).min(g.height);
    let (height, width) = ((row1 - row0).max(1), (col1 - col0).max(1));

    let mut cropped = stack.crop(row0, col0, height, width);
    let cg = cropped.grid;

    let mut keep = vec![false; cg.len()];
    for row in 0..cg.height {
        for col in 0..cg.width {
            keep[cg.index(row, col)] = hull.contains(cg.cell_center(row, col));
        }
    }
    for &p in presences {
        if let Some((row, col)) = cg.cell_of(p) {
            keep[cg.index(row, col)] = true;
        }
    }
    for layer in &mut cropped.layers {
        for (v, &k) in layer.data.iter_mut().zip(keep.iter()) {
            if !k {
                *v = f32::NAN;
            }
        }
    }

    let kept = keep.iter().filter(|&&k| k).count();
    info!(
        "clipped stack to {}x{} cells ({kept} inside study area, hull area {:.2} deg²)",
        cg.width,
        cg.height,
        hull.area()
    );
    Ok(cropped)
}
