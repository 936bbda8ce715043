//! Presence/background model interface and whole-raster prediction.

pub mod maxent;

use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::coords::GeoPoint;
use crate::error::{Result, SdmError};
use crate::features::FeatureTable;
use crate::raster::{RasterLayer, RasterStack};

#[cfg(feature = "threading")]
use rayon::prelude::*;

/// A fitted model: maps one feature vector to a suitability score.
pub trait Scorer {
    /// Predictor names, in the order `score` expects its input.
    fn predictors(&self) -> &[String];

    /// Suitability of one feature vector; NaN if any input is missing.
    fn score(&self, features: &[f64]) -> f64;
}

/// Fits a [`Scorer`] from complete-case rows labeled 1 (presence) or 0 (background).
pub trait Trainer {
    type Model: Scorer + Serialize + DeserializeOwned + Send + Sync;

    fn name(&self) -> &'static str;

    /// Hyper-parameters; part of the model artifact's cache key.
    fn settings(&self) -> Result<serde_json::Value>;

    fn fit(&self, predictors: &[String], rows: &[Vec<f64>], labels: &[u8]) -> Result<Self::Model>;
}

/// Rows of `table` whose id is in `ids` and that carry every predictor value.
pub fn training_rows(table: &FeatureTable, ids: &[usize]) -> (Vec<Vec<f64>>, Vec<u8>) {
    let wanted: std::collections::HashSet<usize> = ids.iter().copied().collect();
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    let mut skipped = 0;
    for r in table.rows.iter().filter(|r| wanted.contains(&r.id)) {
        if r.is_complete() {
            rows.push(r.values.clone());
            labels.push(r.label);
        } else {
            skipped += 1;
        }
    }
    if skipped > 0 {
        warn!("skipped {skipped} training rows with missing predictor values");
    }
    (rows, labels)
}

/// Fit `trainer` on the listed rows of `table`.
pub fn fit_table<T: Trainer>(trainer: &T, table: &FeatureTable, ids: &[usize]) -> Result<T::Model> {
    let (rows, labels) = training_rows(table, ids);
    info!("fitting {} on {} rows x {} predictors", trainer.name(), rows.len(), table.predictors.len());
    trainer.fit(&table.predictors, &rows, &labels)
}

/// Suitability at one coordinate; NaN outside the extent or on a missing cell.
pub fn score_at<M: Scorer>(model: &M, stack: &RasterStack, p: GeoPoint) -> Result<f64> {
    let values = model
        .predictors()
        .iter()
        .map(|name| {
            let layer = stack.layer(name).ok_or_else(|| SdmError::MissingLayer {
                name: name.clone(),
                source_desc: "raster stack".into(),
            })?;
            Ok(layer.value_at(p).map_or(f64::NAN, f64::from))
        })
        .collect::<Result<Vec<f64>>>()?;
    Ok(model.score(&values))
}

/// Score every cell where all the model's predictors hold a value; NaN elsewhere.
pub fn predict_stack<M: Scorer + Sync>(model: &M, stack: &RasterStack) -> Result<RasterLayer> {
    let stack = stack.select(model.predictors())?;
    let g = stack.grid;
    if stack.is_empty() {
        return Err(SdmError::Fit { message: "model has no predictors".into() });
    }

    let score_row = |row: usize| -> Vec<f32> {
        let mut x = vec![0.0f64; stack.len()];
        (0..g.width)
            .map(|col| {
                if !stack.is_valid(row, col) {
                    return f32::NAN;
                }
                for (v, layer) in x.iter_mut().zip(&stack.layers) {
                    *v = layer.get(row, col) as f64;
                }
                model.score(&x) as f32
            })
            .collect()
    };

    #[cfg(feature = "threading")]
    let rows: Vec<Vec<f32>> = (0..g.height).into_par_iter().map(score_row).collect();
    #[cfg(not(feature = "threading"))]
    let rows: Vec<Vec<f32>> = (0..g.height).map(score_row).collect();

    let layer = RasterLayer::from_data("suitability", g, rows.concat())?;
    info!("scored {} of {} cells", layer.valid_count(), g.len());
    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureRow;
    use crate::raster::Grid;

    /// Scores the first predictor unchanged.
    struct Identity(Vec<String>);

    impl Scorer for Identity {
        fn predictors(&self) -> &[String] {
            &self.0
        }
        fn score(&self, features: &[f64]) -> f64 {
            features[0]
        }
    }

    #[test]
    fn prediction_follows_model_predictor_order_and_masks_missing() {
        let g = Grid::new(2, 2, 0.0, 2.0, 1.0, 1.0);
        let a = RasterLayer::from_data("a", g, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = RasterLayer::from_data("b", g, vec![10.0, f32::NAN, 30.0, 40.0]).unwrap();
        let stack = RasterStack::from_layers(vec![a, b]).unwrap();

        let out = predict_stack(&Identity(vec!["b".into(), "a".into()]), &stack).unwrap();
        assert_eq!(out.grid, g);
        assert_eq!(out.get(0, 0), 10.0);
        assert!(out.get(0, 1).is_nan());
        assert_eq!(out.get(1, 1), 40.0);

        // Dropped predictor `b` no longer masks the cell.
        let out = predict_stack(&Identity(vec!["a".into()]), &stack).unwrap();
        assert_eq!(out.get(0, 1), 2.0);
    }

    #[test]
    fn point_scores_match_the_map() {
        let g = Grid::new(2, 1, 0.0, 1.0, 1.0, 1.0);
        let a = RasterLayer::from_data("a", g, vec![1.0, f32::NAN]).unwrap();
        let stack = RasterStack::from_layers(vec![a]).unwrap();
        let model = Identity(vec!["a".into()]);
        assert_eq!(score_at(&model, &stack, GeoPoint::new(0.5, 0.5)).unwrap(), 1.0);
        assert!(score_at(&model, &stack, GeoPoint::new(1.5, 0.5)).unwrap().is_nan());
        assert!(score_at(&model, &stack, GeoPoint::new(9.0, 0.5)).unwrap().is_nan());
    }

    #[test]
    fn unknown_predictor_is_an_error() {
        let g = Grid::new(1, 1, 0.0, 1.0, 1.0, 1.0);
        let stack = RasterStack::from_layers(vec![RasterLayer::new("a", g, 1.0)]).unwrap();
        assert!(matches!(
            predict_stack(&Identity(vec!["z".into()]), &stack),
            Err(SdmError::MissingLayer { .. })
        ));
    }

    #[test]
    fn training_rows_keep_listed_complete_rows() {
        let row = |id, label, v: f64| FeatureRow { id, label, lon: 0.0, lat: 0.0, values: vec![v] };
        let table = FeatureTable {
            predictors: vec!["a".into()],
            rows: vec![row(1, 1, 1.0), row(2, 1, f64::NAN), row(3, 0, 3.0), row(4, 0, 4.0)],
        };
        let (rows, labels) = training_rows(&table, &[1, 2, 3]);
        assert_eq!(rows, vec![vec![1.0], vec![3.0]]);
        assert_eq!(labels, vec![1, 0]);
    }
}
