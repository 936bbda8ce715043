use serde::{Deserialize, Serialize};

use crate::coords::{BBox, GeoPoint};
use crate::error::{Result, SdmError};
use crate::serde_float::null_as_nan_vec;

/// North-up affine grid: row 0 is the northern edge, column 0 the western edge.
/// Coordinate math uses f64; cell values use f32.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
    /// Longitude of the western edge of column 0.
    pub west: f64,
    /// Latitude of the northern edge of row 0.
    pub north: f64,
    /// Cell size in degrees of longitude.
    pub cell_width: f64,
    /// Cell size in degrees of latitude (positive; rows run southwards).
    pub cell_height: f64,
}

impl Grid {
    pub fn new(width: usize, height: usize, west: f64, north: f64, cell_width: f64, cell_height: f64) -> Self {
        Self { width, height, west, north, cell_width, cell_height }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    pub fn east(&self) -> f64 {
        self.west + self.width as f64 * self.cell_width
    }

    pub fn south(&self) -> f64 {
        self.north - self.height as f64 * self.cell_height
    }

    pub fn bbox(&self) -> BBox {
        BBox { min_lon: self.west, max_lon: self.east(), min_lat: self.south(), max_lat: self.north }
    }

    /// Cell containing `p`, or None outside the extent.
    /// Points on the eastern/southern boundary belong to the last column/row.
    pub fn cell_of(&self, p: GeoPoint) -> Option<(usize, usize)> {
        if !p.is_finite() || !self.bbox().contains(p) || self.is_empty() {
            return None;
        }
        let col = ((p.lon - self.west) / self.cell_width).floor() as usize;
        let row = ((self.north - p.lat) / self.cell_height).floor() as usize;
        Some((row.min(self.height - 1), col.min(self.width - 1)))
    }

    pub fn cell_center(&self, row: usize, col: usize) -> GeoPoint {
        GeoPoint::new(
            self.west + (col as f64 + 0.5) * self.cell_width,
            self.north - (row as f64 + 0.5) * self.cell_height,
        )
    }

    /// Sub-grid starting at (`row0`, `col0`) spanning `height` × `width` cells.
    pub fn window(&self, row0: usize, col0: usize, height: usize, width: usize) -> Grid {
        Grid {
            width,
            height,
            west: self.west + col0 as f64 * self.cell_width,
            north: self.north - row0 as f64 * self.cell_height,
            cell_width: self.cell_width,
            cell_height: self.cell_height,
        }
    }

    /// Same shape and georeferencing, up to float noise from different encoders.
    pub fn aligned_with(&self, other: &Grid) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-9 * (1.0 + a.abs().max(b.abs()));
        self.width == other.width
            && self.height == other.height
            && close(self.west, other.west)
            && close(self.north, other.north)
            && close(self.cell_width, other.cell_width)
            && close(self.cell_height, other.cell_height)
    }
}

/// One environmental predictor on a grid. Missing cells are NaN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterLayer {
    pub name: String,
    pub grid: Grid,
    /// Row-major cell values.
    #[serde(deserialize_with = "null_as_nan_vec")]
    pub data: Vec<f32>,
}

impl RasterLayer {
    /// Create a new layer filled with the given value.
    pub fn new(name: impl Into<String>, grid: Grid, fill: f32) -> Self {
        Self { name: name.into(), grid, data: vec![fill; grid.len()] }
    }

    pub fn from_data(name: impl Into<String>, grid: Grid, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        if data.len() != grid.len() {
            return Err(SdmError::GridMismatch {
                name,
                detail: format!("{} values for a {}x{} grid", data.len(), grid.width, grid.height),
            });
        }
        Ok(Self { name, grid, data })
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[self.grid.index(row, col)]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f32) {
        let i = self.grid.index(row, col);
        self.data[i] = val;
    }

    #[inline]
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.get(row, col).is_finite()
    }

    /// Value of the cell containing `p`; None outside the extent or on a missing cell.
    pub fn value_at(&self, p: GeoPoint) -> Option<f32> {
        let (row, col) = self.grid.cell_of(p)?;
        let v = self.get(row, col);
        v.is_finite().then_some(v)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_finite()).count()
    }

    pub fn crop(&self, row0: usize, col0: usize, height: usize, width: usize) -> RasterLayer {
        let grid = self.grid.window(row0, col0, height, width);
        let mut data = Vec::with_capacity(grid.len());
        for r in row0..row0 + height {
            let start = self.grid.index(r, col0);
            data.extend_from_slice(&self.data[start..start + width]);
        }
        RasterLayer { name: self.name.clone(), grid, data }
    }
}

/// Named predictors sharing one grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterStack {
    pub grid: Grid,
    pub layers: Vec<RasterLayer>,
}

impl RasterStack {
    pub fn new(grid: Grid) -> Self {
        Self { grid, layers: Vec::new() }
    }

    /// Append a layer, enforcing the shared-grid invariant and unique names.
    pub fn push(&mut self, layer: RasterLayer) -> Result<()> {
        if !layer.grid.aligned_with(&self.grid) {
            return Err(SdmError::GridMismatch {
                name: layer.name.clone(),
                detail: format!("{:?} vs stack {:?}", layer.grid, self.grid),
            });
        }
        if self.layer(&layer.name).is_some() {
            return Err(SdmError::GridMismatch {
                name: layer.name.clone(),
                detail: "duplicate layer name".into(),
            });
        }
        self.layers.push(RasterLayer { grid: self.grid, ..layer });
        Ok(())
    }

    /// Build a stack from layers; the first layer defines the grid.
    pub fn from_layers(layers: Vec<RasterLayer>) -> Result<Self> {
        let Some(first) = layers.first() else {
            return Err(SdmError::InvalidConfig { message: "a raster stack needs at least one layer".into() });
        };
        let mut stack = Self::new(first.grid);
        for layer in layers {
            stack.push(layer)?;
        }
        Ok(stack)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    pub fn layer(&self, name: &str) -> Option<&RasterLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Sub-stack with the named layers, in the given order.
    pub fn select(&self, names: &[String]) -> Result<RasterStack> {
        let mut out = RasterStack::new(self.grid);
        for name in names {
            let layer = self.layer(name).ok_or_else(|| SdmError::MissingLayer {
                name: name.clone(),
                source_desc: "raster stack".into(),
            })?;
            out.layers.push(layer.clone());
        }
        Ok(out)
    }

    /// True where every layer has a value.
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.layers.iter().all(|l| l.is_valid(row, col))
    }

    /// Layer that is 1 where every predictor has a value and NaN elsewhere.
    pub fn validity_layer(&self) -> RasterLayer {
        let data = (0..self.grid.height)
            .flat_map(|row| (0..self.grid.width).map(move |col| (row, col)))
            .map(|(row, col)| if self.is_valid(row, col) { 1.0 } else { f32::NAN })
            .collect();
        RasterLayer { name: "valid".into(), grid: self.grid, data }
    }

    /// Per-layer values at `p` (NaN where missing or outside the extent).
    pub fn values_at(&self, p: GeoPoint) -> Vec<f64> {
        match self.grid.cell_of(p) {
            Some((row, col)) => self.layers.iter().map(|l| l.get(row, col) as f64).collect(),
            None => vec![f64::NAN; self.layers.len()],
        }
    }

    pub fn crop(&self, row0: usize, col0: usize, height: usize, width: usize) -> RasterStack {
        RasterStack {
            grid: self.grid.window(row0, col0, height, width),
            layers: self.layers.iter().map(|l| l.crop(row0, col0, height, width)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_grid(w: usize, h: usize) -> Grid {
        Grid::new(w, h, 0.0, h as f64, 1.0, 1.0)
    }

    #[test]
    fn cell_of_and_center_agree() {
        let g = Grid::new(10, 5, -80.0, 10.0, 0.5, 0.5);
        for row in 0..g.height {
            for col in 0..g.width {
                assert_eq!(g.cell_of(g.cell_center(row, col)), Some((row, col)));
            }
        }
    }

    #[test]
    fn cell_of_outside_returns_none() {
        let g = unit_grid(4, 4);
        assert!(g.cell_of(GeoPoint::new(-0.1, 2.0)).is_none());
        assert!(g.cell_of(GeoPoint::new(2.0, 4.1)).is_none());
        assert!(g.cell_of(GeoPoint::new(f64::NAN, 2.0)).is_none());
    }

    #[test]
    fn boundary_points_map_to_edge_cells() {
        let g = unit_grid(4, 4);
        assert_eq!(g.cell_of(GeoPoint::new(4.0, 0.0)), Some((3, 3)));
        assert_eq!(g.cell_of(GeoPoint::new(0.0, 4.0)), Some((0, 0)));
    }

    #[test]
    fn value_at_skips_missing_cells() {
        let mut layer = RasterLayer::new("t", unit_grid(2, 2), 1.0);
        layer.set(0, 1, f32::NAN);
        assert_eq!(layer.value_at(GeoPoint::new(0.5, 1.5)), Some(1.0));
        assert_eq!(layer.value_at(GeoPoint::new(1.5, 1.5)), None);
        assert_eq!(layer.valid_count(), 3);
    }

    #[test]
    fn crop_keeps_georeferencing() {
        let g = unit_grid(4, 4);
        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let layer = RasterLayer::from_data("t", g, data).unwrap();
        let c = layer.crop(1, 2, 2, 2);
        assert_eq!(c.data, vec![6.0, 7.0, 10.0, 11.0]);
        assert_eq!(c.grid.west, 2.0);
        assert_eq!(c.grid.north, 3.0);
        let p = c.grid.cell_center(0, 0);
        assert_eq!(layer.value_at(p), c.value_at(p));
    }

    #[test]
    fn stack_rejects_misaligned_layer() {
        let mut s = RasterStack::new(unit_grid(3, 3));
        s.push(RasterLayer::new("a", unit_grid(3, 3), 0.0)).unwrap();
        let err = s.push(RasterLayer::new("b", unit_grid(4, 3), 0.0)).unwrap_err();
        assert!(matches!(err, SdmError::GridMismatch { .. }));
        assert!(s.push(RasterLayer::new("a", unit_grid(3, 3), 0.0)).is_err());
    }

    #[test]
    fn validity_layer_requires_all_layers() {
        let g = unit_grid(2, 1);
        let mut a = RasterLayer::new("a", g, 1.0);
        a.set(0, 0, f32::NAN);
        let mut b = RasterLayer::new("b", g, 2.0);
        b.set(0, 1, f32::NAN);
        let stack = RasterStack::from_layers(vec![a, b]).unwrap();
        assert_eq!(stack.validity_layer().valid_count(), 0);
    }

    #[test]
    fn json_round_trip_preserves_nan() {
        let mut layer = RasterLayer::new("t", unit_grid(2, 1), 3.5);
        layer.set(0, 0, f32::NAN);
        let json = serde_json::to_string(&layer).unwrap();
        let back: RasterLayer = serde_json::from_str(&json).unwrap();
        assert!(back.get(0, 0).is_nan());
        assert_eq!(back.get(0, 1), 3.5);
    }
}
