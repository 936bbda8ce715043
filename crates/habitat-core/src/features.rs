//! Feature extraction: raster values under each labeled point.

use std::path::Path;

use log::{info, warn};

use crate::error::{Result, SdmError};
use crate::labeled::LabeledPoint;
use crate::raster::RasterStack;

#[cfg(feature = "threading")]
use rayon::prelude::*;

const FIXED_COLUMNS: [&str; 4] = ["id", "label", "lon", "lat"];

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub id: usize,
    pub label: u8,
    pub lon: f64,
    pub lat: f64,
    /// One value per predictor, NaN where missing.
    pub values: Vec<f64>,
}

impl FeatureRow {
    pub fn is_complete(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// One row per labeled point, one column per predictor.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub predictors: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

/// Read every layer at every point. Rows are never dropped; points outside the
/// extent or on missing cells carry NaN. Also returns the number of missing values.
pub fn extract_features(stack: &RasterStack, points: &[LabeledPoint]) -> (FeatureTable, usize) {
    let row_for = |p: &LabeledPoint| FeatureRow {
        id: p.id,
        label: p.label,
        lon: p.lon,
        lat: p.lat,
        values: stack.values_at(p.point()),
    };

    #[cfg(feature = "threading")]
    let rows: Vec<FeatureRow> = points.par_iter().map(row_for).collect();
    #[cfg(not(feature = "threading"))]
    let rows: Vec<FeatureRow> = points.iter().map(row_for).collect();

    let table = FeatureTable { predictors: stack.names(), rows };
    let missing = table.missing_values();
    if missing > 0 {
        warn!(
            "{missing} missing values; {} of {} points lack at least one predictor",
            table.incomplete_rows(),
            table.rows.len()
        );
    }
    info!("extracted {} predictors for {} points", table.predictors.len(), table.rows.len());
    (table, missing)
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of individual missing cells across the table.
    pub fn missing_values(&self) -> usize {
        self.rows.iter().map(|r| r.values.iter().filter(|v| !v.is_finite()).count()).sum()
    }

    pub fn incomplete_rows(&self) -> usize {
        self.rows.iter().filter(|r| !r.is_complete()).count()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.predictors.iter().position(|p| p == name)
    }

    /// Values of one predictor over complete rows only.
    pub fn complete_columns(&self) -> Vec<Vec<f64>> {
        let complete: Vec<&FeatureRow> = self.rows.iter().filter(|r| r.is_complete()).collect();
        (0..self.predictors.len())
            .map(|j| complete.iter().map(|r| r.values[j]).collect())
            .collect()
    }

    /// Same rows restricted to `names`, in that order.
    pub fn select(&self, names: &[String]) -> Result<FeatureTable> {
        let idx: Vec<usize> = names
            .iter()
            .map(|n| {
                self.column_index(n).ok_or_else(|| SdmError::MissingLayer {
                    name: n.clone(),
                    source_desc: "feature table".into(),
                })
            })
            .collect::<Result<_>>()?;
        let rows = self
            .rows
            .iter()
            .map(|r| FeatureRow { values: idx.iter().map(|&j| r.values[j]).collect(), ..r.clone() })
            .collect();
        Ok(FeatureTable { predictors: names.to_vec(), rows })
    }

    /// CSV with columns `id,label,lon,lat,<predictors...>`; missing values are empty fields.
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        let header: Vec<&str> = FIXED_COLUMNS
            .iter()
            .copied()
            .chain(self.predictors.iter().map(String::as_str))
            .collect();
        wtr.write_record(&header)?;
        for r in &self.rows {
            let mut rec = vec![r.id.to_string(), r.label.to_string(), r.lon.to_string(), r.lat.to_string()];
            rec.extend(r.values.iter().map(|v| if v.is_finite() { v.to_string() } else { String::new() }));
            wtr.write_record(&rec)?;
        }
        wtr.flush().map_err(|e| SdmError::io(path, e))?;
        Ok(())
    }

    pub fn load_csv(path: &Path) -> Result<FeatureTable> {
        let mut rdr = csv::Reader::from_path(path)?;
        let headers = rdr.headers()?.clone();
        let fixed: Vec<&str> = headers.iter().take(FIXED_COLUMNS.len()).collect();
        if fixed != FIXED_COLUMNS {
            return Err(SdmError::SchemaMismatch {
                path: path.to_path_buf(),
                expected: FIXED_COLUMNS.join(","),
                found: fixed.join(","),
            });
        }
        let predictors: Vec<String> = headers.iter().skip(FIXED_COLUMNS.len()).map(str::to_string).collect();

        let mut rows = Vec::new();
        for (line, rec) in rdr.records().enumerate() {
            let rec = rec?;
            let bad = |what: &str| SdmError::corrupt(path, format!("row {}: bad {what}", line + 1));
            let field = |i: usize| rec.get(i).unwrap_or_default();
            let id = field(0).parse::<usize>().map_err(|_| bad("id"))?;
            let label = field(1).parse::<u8>().map_err(|_| bad("label"))?;
            let lon = field(2).parse::<f64>().map_err(|_| bad("lon"))?;
            let lat = field(3).parse::<f64>().map_err(|_| bad("lat"))?;
            let values = (0..predictors.len())
                .map(|j| {
                    let s = field(FIXED_COLUMNS.len() + j);
                    if s.is_empty() {
                        Ok(f64::NAN)
                    } else {
                        s.parse::<f64>().map_err(|_| bad(&predictors[j]))
                    }
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(FeatureRow { id, label, lon, lat, values });
        }
        Ok(FeatureTable { predictors, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Grid, RasterLayer};

    fn stack() -> RasterStack {
        let g = Grid::new(3, 3, 0.0, 3.0, 1.0, 1.0);
        let a = RasterLayer::from_data("a", g, (0..9).map(|i| i as f32).collect()).unwrap();
        let mut b = RasterLayer::new("b", g, 5.0);
        b.set(1, 1, f32::NAN);
        RasterStack::from_layers(vec![a, b]).unwrap()
    }

    fn points() -> Vec<LabeledPoint> {
        let mk = |id, label, lon, lat| LabeledPoint { id, label, lon, lat, source_key: None };
        vec![mk(1, 1, 0.5, 2.5), mk(2, 1, 1.5, 1.5), mk(3, 0, 10.0, 10.0), mk(4, 0, 2.5, 0.5)]
    }

    #[test]
    fn one_row_per_point_with_nan_for_missing() {
        let (t, missing) = extract_features(&stack(), &points());
        assert_eq!(missing, 3);
        assert_eq!(t.len(), 4);
        assert_eq!(t.predictors, vec!["a", "b"]);
        assert_eq!(t.rows[0].values, vec![0.0, 5.0]);
        // Centre cell: `a` present, `b` missing.
        assert_eq!(t.rows[1].values[0], 4.0);
        assert!(t.rows[1].values[1].is_nan());
        // Outside the extent: all missing, never zero.
        assert!(t.rows[2].values.iter().all(|v| v.is_nan()));
        assert_eq!(t.rows[3].values, vec![8.0, 5.0]);
        assert_eq!(t.rows[2].label, 0);
        assert_eq!((t.rows[3].lon, t.rows[3].lat), (2.5, 0.5));
        assert_eq!(t.missing_values(), 3);
        assert_eq!(t.incomplete_rows(), 2);
    }

    #[test]
    fn extraction_is_idempotent() {
        let s = stack();
        let p = points();
        let (a, _) = extract_features(&s, &p);
        let (b, _) = extract_features(&s, &p);
        assert_eq!(a.predictors, b.predictors);
        for (ra, rb) in a.rows.iter().zip(&b.rows) {
            assert_eq!((ra.id, ra.label), (rb.id, rb.label));
            for (x, y) in ra.values.iter().zip(&rb.values) {
                assert!(x == y || (x.is_nan() && y.is_nan()));
            }
        }
    }

    #[test]
    fn csv_round_trip_keeps_missing_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.csv");
        let (t, _) = extract_features(&stack(), &points());
        t.save_csv(&path).unwrap();
        let back = FeatureTable::load_csv(&path).unwrap();
        assert_eq!(back.predictors, t.predictors);
        assert_eq!(back.len(), 4);
        assert!(back.rows[1].values[1].is_nan());
        assert_eq!(back.missing_values(), t.missing_values());
    }

    #[test]
    fn load_rejects_foreign_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.csv");
        std::fs::write(&path, "x,y\n1,2\n").unwrap();
        assert!(matches!(FeatureTable::load_csv(&path), Err(SdmError::SchemaMismatch { .. })));
    }

    #[test]
    fn select_reorders_columns() {
        let (t, _) = extract_features(&stack(), &points());
        let s = t.select(&["b".to_string(), "a".to_string()]).unwrap();
        assert_eq!(s.rows[3].values, vec![5.0, 8.0]);
        assert!(t.select(&["zz".to_string()]).is_err());
    }
}
