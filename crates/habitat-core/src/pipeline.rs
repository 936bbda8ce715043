//! Pipeline orchestrator: runs every stage in order, reusing cached artifacts.

use std::path::Path;
use std::time::Instant;

use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::{load_csv_rows, save_csv_rows, ArtifactStore, CacheKey};
use crate::collinearity::{reduce_collinearity, CollinearityReport};
use crate::config::PipelineConfig;
use crate::error::{Result, SdmError};
use crate::evaluate::{evaluate_model, stratified_split, DataSplit, EvaluationReport};
use crate::features::{extract_features, FeatureTable};
use crate::hull::{clip_to_hull, ConvexHull};
use crate::labeled::{self, merge_points, LabeledPoint};
use crate::layers::{self, LayerSource};
use crate::model::maxent::MaxentTrainer;
use crate::model::{fit_table, predict_stack, Trainer};
use crate::occurrence::{self, ObservationPoint, OccurrenceSource};
use crate::raster::{RasterLayer, RasterStack};
use crate::sampler::{occupancy_mask, sample_background, BackgroundPoint};

/// Fixed artifact file names inside the data directory.
pub mod artifacts {
    pub const PRESENCE: &str = "presence.csv";
    pub const HULL: &str = "hull.json";
    pub const STACK: &str = "stack.json";
    pub const BACKGROUND: &str = "background.csv";
    pub const LABELED: &str = "labeled.csv";
    pub const FEATURES: &str = "features.csv";
    pub const COLLINEARITY: &str = "collinearity.json";
    pub const SPLIT: &str = "split.json";
    pub const MODEL: &str = "model.json";
    pub const EVALUATION: &str = "evaluation.json";
    pub const SUITABILITY: &str = "suitability.json";
}

// Per-stage seed salts so stages draw independent streams from one seed.
const BACKGROUND_SALT: u64 = 0xB4C6_0001;
const SPLIT_SALT: u64 = 0x5A17_0002;

/// Timing and cache outcome of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub artifact: String,
    pub cached: bool,
    pub elapsed_ms: u64,
    pub key: String,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct PipelineRun<M> {
    pub stages: Vec<StageReport>,
    pub presences: Vec<ObservationPoint>,
    pub labeled: Vec<LabeledPoint>,
    pub collinearity: CollinearityReport,
    pub model: M,
    pub evaluation: EvaluationReport,
    pub suitability: RasterLayer,
}

/// Records one [`StageReport`] per artifact.
struct Stages<'s> {
    store: &'s ArtifactStore,
    reports: Vec<StageReport>,
}

impl<'s> Stages<'s> {
    fn record<V>(&mut self, name: &str, key: &CacheKey, stage: impl FnOnce(&ArtifactStore) -> Result<V>) -> Result<V> {
        let cached = self.store.will_reuse(name, key);
        let t0 = Instant::now();
        let value = stage(self.store)?;
        self.reports.push(StageReport {
            artifact: name.to_string(),
            cached,
            elapsed_ms: t0.elapsed().as_millis() as u64,
            key: key.to_string(),
        });
        Ok(value)
    }

    fn run<V>(
        &mut self,
        name: &str,
        key: &CacheKey,
        load: impl FnOnce(&Path) -> Result<V>,
        save: impl FnOnce(&V, &Path) -> Result<()>,
        compute: impl FnOnce() -> Result<V>,
    ) -> Result<V> {
        self.record(name, key, |store| store.get_or_compute(name, key, load, save, compute))
    }

    fn json<V: Serialize + DeserializeOwned>(
        &mut self,
        name: &str,
        key: &CacheKey,
        compute: impl FnOnce() -> Result<V>,
    ) -> Result<V> {
        self.record(name, key, |store| store.json(name, key, compute))
    }

    fn csv<V: Serialize + DeserializeOwned>(
        &mut self,
        name: &str,
        key: &CacheKey,
        compute: impl FnOnce() -> Result<Vec<V>>,
    ) -> Result<Vec<V>> {
        self.record(name, key, |store| store.csv(name, key, compute))
    }
}

pub struct Pipeline<T: Trainer = MaxentTrainer> {
    config: PipelineConfig,
    occurrences: Box<dyn OccurrenceSource>,
    layers: Box<dyn LayerSource>,
    trainer: T,
}

impl Pipeline<MaxentTrainer> {
    /// Build sources and trainer from the configuration.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let occurrences = occurrence::source_from_config(&config.occurrences)?;
        let layers = layers::source_from_config(&config.layer_source);
        let trainer = MaxentTrainer::new(config.maxent.clone());
        Ok(Self::with_sources(config, occurrences, layers, trainer))
    }
}

impl<T: Trainer> Pipeline<T> {
    pub fn with_sources(
        config: PipelineConfig,
        occurrences: Box<dyn OccurrenceSource>,
        layers: Box<dyn LayerSource>,
        trainer: T,
    ) -> Self {
        Self { config, occurrences, layers, trainer }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage. Stages whose artifact is current are reloaded instead
    /// of recomputed, unless `force_recompute` is set.
    ///
    /// Stage order:
    ///   1. Occurrences
    ///   2. Study area (hull, clipped stack)
    ///   3. Background sample
    ///   4. Labeled set
    ///   5. Features
    ///   6. Collinearity reduction
    ///   7. Train/test split
    ///   8. Model fit
    ///   9. Evaluation
    ///  10. Suitability map
    pub fn run(&self) -> Result<PipelineRun<T::Model>> {
        use artifacts::*;

        let cfg = &self.config;
        let store = ArtifactStore::open(&cfg.data_dir, cfg.force_recompute)?;
        let mut stages = Stages { store: &store, reports: Vec::new() };
        info!("running pipeline for '{}' in {}", cfg.species, store.dir().display());

        // ── 1. Occurrences ──────────────────────────────────────────────────
        let k_presence = CacheKey::new("occurrences", &(&cfg.species, &cfg.occurrences), &[])?;
        let presences: Vec<ObservationPoint> = stages.csv(PRESENCE, &k_presence, || {
            info!("fetching occurrences from {}", self.occurrences.describe());
            self.occurrences.fetch(&cfg.species)
        })?;
        if presences.is_empty() {
            return Err(SdmError::NoOccurrences { species: cfg.species.clone() });
        }
        let presence_points: Vec<_> = presences.iter().map(ObservationPoint::point).collect();

        // ── 2. Study area ───────────────────────────────────────────────────
        let k_hull = CacheKey::new("hull", &(), &[&k_presence])?;
        let hull: ConvexHull = stages.json(HULL, &k_hull, || ConvexHull::from_points(&presence_points))?;

        let k_stack = CacheKey::new("stack", &(&cfg.layer_source, &cfg.layers), &[&k_hull])?;
        let stack: RasterStack = stages.json(STACK, &k_stack, || {
            info!("loading {} layers from {}", cfg.layers.len(), self.layers.describe());
            let full = self.layers.load(&cfg.layers)?;
            clip_to_hull(&full, &hull, &presence_points)
        })?;

        // ── 3. Background sample ────────────────────────────────────────────
        let k_background = CacheKey::new("background", &cfg.seed, &[&k_presence, &k_stack])?;
        let background: Vec<BackgroundPoint> = stages.csv(BACKGROUND, &k_background, || {
            let valid = stack.validity_layer();
            let occupied = occupancy_mask(&valid, &presence_points);
            let mut rng = StdRng::seed_from_u64(cfg.seed ^ BACKGROUND_SALT);
            sample_background(&valid, presences.len(), &occupied, &mut rng)
        })?;

        // ── 4. Labeled set ──────────────────────────────────────────────────
        let k_labeled = CacheKey::new("labeled", &(), &[&k_presence, &k_background])?;
        let labeled_points: Vec<LabeledPoint> = stages.run(
            LABELED,
            &k_labeled,
            |path| {
                let points: Vec<LabeledPoint> = load_csv_rows(path)?;
                labeled::validate(&points).map_err(|m| SdmError::corrupt(path, m))?;
                Ok(points)
            },
            |points, path| save_csv_rows(points.as_slice(), path),
            || merge_points(&presences, &background),
        )?;

        // ── 5. Features ─────────────────────────────────────────────────────
        let k_features = CacheKey::new("features", &(), &[&k_labeled, &k_stack])?;
        let table: FeatureTable = stages.run(
            FEATURES,
            &k_features,
            FeatureTable::load_csv,
            |table, path| table.save_csv(path),
            || Ok(extract_features(&stack, &labeled_points).0),
        )?;
        if table.len() != labeled_points.len() {
            return Err(SdmError::corrupt(
                store.path(FEATURES),
                format!("{} rows for {} labeled points", table.len(), labeled_points.len()),
            ));
        }

        // ── 6. Collinearity reduction ───────────────────────────────────────
        let k_collinearity = CacheKey::new("collinearity", &cfg.collinearity_threshold, &[&k_features])?;
        let collinearity: CollinearityReport = stages.json(COLLINEARITY, &k_collinearity, || {
            reduce_collinearity(&table.predictors, &table.complete_columns(), cfg.collinearity_threshold)
        })?;

        // ── 7. Train/test split ─────────────────────────────────────────────
        let k_split = CacheKey::new("split", &(cfg.seed, cfg.train_proportion), &[&k_labeled])?;
        let split: DataSplit = stages.json(SPLIT, &k_split, || {
            let mut rng = StdRng::seed_from_u64(cfg.seed ^ SPLIT_SALT);
            Ok(stratified_split(&labeled_points, cfg.train_proportion, &mut rng))
        })?;

        // ── 8. Model fit ────────────────────────────────────────────────────
        let settings = (self.trainer.name(), self.trainer.settings()?);
        let k_model = CacheKey::new("model", &settings, &[&k_features, &k_collinearity, &k_split])?;
        let model: T::Model = stages.json(MODEL, &k_model, || {
            let reduced = table.select(&collinearity.kept)?;
            fit_table(&self.trainer, &reduced, &split.train)
        })?;

        // ── 9. Evaluation ───────────────────────────────────────────────────
        let k_evaluation = CacheKey::new("evaluation", &(), &[&k_model, &k_split, &k_features])?;
        let evaluation: EvaluationReport =
            stages.json(EVALUATION, &k_evaluation, || evaluate_model(&model, &table, &split))?;

        // ── 10. Suitability map ─────────────────────────────────────────────
        let k_suitability = CacheKey::new("suitability", &(), &[&k_model, &k_stack])?;
        let suitability: RasterLayer = stages.json(SUITABILITY, &k_suitability, || predict_stack(&model, &stack))?;

        let reused = stages.reports.iter().filter(|s| s.cached).count();
        info!("pipeline finished: {reused}/{} stages reused", stages.reports.len());

        Ok(PipelineRun {
            stages: stages.reports,
            presences,
            labeled: labeled_points,
            collinearity,
            model,
            evaluation,
            suitability,
        })
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::load_json;
    use crate::collinearity::pearson;
    use crate::raster::Grid;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Presences concentrated in the warm east of a box spanning lon 0..15, lat -10..10.
    struct FixedOccurrences {
        calls: Arc<AtomicUsize>,
    }

    impl OccurrenceSource for FixedOccurrences {
        fn describe(&self) -> String {
            "fixed test records".into()
        }

        fn fetch(&self, _species: &str) -> Result<Vec<ObservationPoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut coords = vec![(0.5, -9.5), (14.5, -9.5), (14.5, 9.5), (0.5, 9.5)];
            for i in 0..36 {
                coords.push((10.5 + (i % 4) as f64, -8.5 + (i / 4) as f64 * 2.0));
            }
            Ok(coords
                .into_iter()
                .enumerate()
                .map(|(i, (lon, lat))| ObservationPoint {
                    key: format!("occ-{i}"),
                    lon,
                    lat,
                    scientific_name: Some("Testus syntheticus".into()),
                    country: None,
                    event_date: None,
                    basis_of_record: None,
                })
                .collect())
        }
    }

    /// 40×40 one-degree grid over lon -20..20, lat -20..20.
    struct SyntheticLayers;

    impl LayerSource for SyntheticLayers {
        fn describe(&self) -> String {
            "synthetic gradients".into()
        }

        fn load(&self, names: &[String]) -> Result<RasterStack> {
            let g = Grid::new(40, 40, -20.0, 20.0, 1.0, 1.0);
            let field = |f: &dyn Fn(usize, usize) -> f32| -> Vec<f32> {
                (0..g.height).flat_map(|r| (0..g.width).map(move |c| (r, c))).map(|(r, c)| f(r, c)).collect()
            };
            let layers = names
                .iter()
                .map(|name| {
                    let data = match name.as_str() {
                        "temp" => field(&|_, c| 10.0 + c as f32),
                        "temp_x2" => field(&|r, c| 20.0 + 2.0 * c as f32 + 0.01 * (r % 3) as f32),
                        "rain" => field(&|r, c| 500.0 + 25.0 * r as f32 + 3.0 * ((r * 7 + c * 13) % 11) as f32),
                        other => {
                            return Err(SdmError::MissingLayer {
                                name: other.to_string(),
                                source_desc: self.describe(),
                            })
                        }
                    };
                    RasterLayer::from_data(name.clone(), g, data)
                })
                .collect::<Result<Vec<_>>>()?;
            RasterStack::from_layers(layers)
        }
    }

    fn config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            data_dir: dir.to_path_buf(),
            layers: vec!["temp".into(), "temp_x2".into(), "rain".into()],
            ..PipelineConfig::default()
        }
    }

    fn pipeline(cfg: PipelineConfig, calls: &Arc<AtomicUsize>) -> Pipeline {
        let trainer = MaxentTrainer::new(cfg.maxent.clone());
        Pipeline::with_sources(
            cfg,
            Box::new(FixedOccurrences { calls: Arc::clone(calls) }),
            Box::new(SyntheticLayers),
            trainer,
        )
    }

    #[test]
    fn end_to_end_run_produces_consistent_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let run = pipeline(config(dir.path()), &calls).run().unwrap();

        assert_eq!(run.presences.len(), 40);
        assert_eq!(run.labeled.len(), 80);
        assert!(run.labeled.iter().enumerate().all(|(i, p)| p.id == i + 1));
        assert_eq!(labeled::class_counts(&run.labeled), (40, 40));

        // temp and temp_x2 are near-duplicates: exactly one survives.
        let kept = &run.collinearity.kept;
        assert_eq!(kept.iter().filter(|n| n.starts_with("temp")).count(), 1);
        assert!(kept.contains(&"rain".to_string()));
        let table = FeatureTable::load_csv(&dir.path().join(artifacts::FEATURES)).unwrap();
        let reduced = table.select(kept).unwrap();
        let cols = reduced.complete_columns();
        for i in 0..cols.len() {
            for j in i + 1..cols.len() {
                assert!(pearson(&cols[i], &cols[j]).abs() <= 0.7);
            }
        }

        let e = &run.evaluation;
        assert!((0.0..=1.0).contains(&e.auc));
        assert!((e.tpr + e.fnr - 1.0).abs() < 1e-9);
        assert!((e.fpr + e.tnr - 1.0).abs() < 1e-9);
        assert!(e.auc > 0.5, "east-concentrated presences should be predictable, AUC {}", e.auc);

        let stack: RasterStack = load_json(&dir.path().join(artifacts::STACK)).unwrap();
        assert_eq!(run.suitability.grid, stack.grid);
        assert!(run.suitability.data.iter().all(|v| v.is_nan() || (0.0..=1.0).contains(v)));

        for name in [artifacts::PRESENCE, artifacts::SPLIT, artifacts::MODEL, artifacts::SUITABILITY] {
            assert!(dir.path().join(name).is_file());
            assert!(dir.path().join(format!("{name}.key")).is_file());
        }
        assert!(run.stages.iter().all(|s| !s.cached));
        assert!(format!("{run:?}").contains("suitability"));
    }

    #[test]
    fn second_run_reuses_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let first = pipeline(config(dir.path()), &calls).run().unwrap();
        let second = pipeline(config(dir.path()), &calls).run().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(second.stages.iter().all(|s| s.cached));
        assert_eq!(second.labeled, first.labeled);
        assert_eq!(second.collinearity.kept, first.collinearity.kept);
        assert_eq!(second.evaluation.confusion, first.evaluation.confusion);
    }

    #[test]
    fn force_recomputes_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline(config(dir.path()), &calls).run().unwrap();
        let cfg = PipelineConfig { force_recompute: true, ..config(dir.path()) };
        let forced = pipeline(cfg, &calls).run().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(forced.stages.iter().all(|s| !s.cached));
    }

    #[test]
    fn new_seed_invalidates_only_downstream_stages() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline(config(dir.path()), &calls).run().unwrap();
        let cfg = PipelineConfig { seed: 7, ..config(dir.path()) };
        let run = pipeline(cfg, &calls).run().unwrap();

        let cached = |name: &str| run.stages.iter().find(|s| s.artifact == name).map(|s| s.cached);
        assert_eq!(cached(artifacts::PRESENCE), Some(true));
        assert_eq!(cached(artifacts::HULL), Some(true));
        assert_eq!(cached(artifacts::STACK), Some(true));
        assert_eq!(cached(artifacts::BACKGROUND), Some(false));
        assert_eq!(cached(artifacts::MODEL), Some(false));
    }

    #[test]
    fn same_seed_same_artifacts() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline(config(a.path()), &calls).run().unwrap();
        pipeline(config(b.path()), &calls).run().unwrap();
        for name in [artifacts::BACKGROUND, artifacts::LABELED, artifacts::SPLIT] {
            let x = std::fs::read(a.path().join(name)).unwrap();
            let y = std::fs::read(b.path().join(name)).unwrap();
            assert_eq!(x, y, "{name} differs between identical runs");
        }
    }

    #[test]
    fn corrupt_labeled_artifact_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline(config(dir.path()), &calls).run().unwrap();
        std::fs::write(dir.path().join(artifacts::LABELED), "id,label,lon,lat,source_key\n3,1,0.0,0.0,\n").unwrap();
        let err = pipeline(config(dir.path()), &calls).run().unwrap_err();
        assert!(matches!(err, SdmError::CorruptArtifact { .. }));
    }
}
