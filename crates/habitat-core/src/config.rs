//! Pipeline configuration, threaded explicitly through every stage.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdmError};
use crate::model::maxent::MaxentParams;

/// Where presence records come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OccurrenceSourceConfig {
    /// GBIF occurrence search API.
    Gbif {
        /// Base URL, e.g. `https://api.gbif.org/v1`.
        endpoint: String,
        /// Upper bound on records fetched across all pages.
        max_records: usize,
        /// Fail instead of warning when `max_records` cuts the download short.
        #[serde(default)]
        require_complete: bool,
    },
    /// Local tab- or comma-separated occurrence export.
    Csv { path: PathBuf },
}

/// Where environmental layers come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSourceConfig {
    /// Directory holding one GeoTIFF per layer.
    Directory { path: PathBuf },
    /// `.tar` / `.tar.gz` bundle of GeoTIFFs, downloaded from `url` when absent.
    Archive { path: PathBuf, url: Option<String> },
}

/// Full pipeline configuration.
/// Defaults reproduce the classic three-toed sloth example on WorldClim 10' layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding every cached artifact.
    pub data_dir: PathBuf,
    pub seed: u64,
    /// Recompute every stage even when its artifact is current.
    pub force_recompute: bool,
    /// Scientific name queried at the occurrence source.
    pub species: String,
    pub occurrences: OccurrenceSourceConfig,
    pub layer_source: LayerSourceConfig,
    /// Layer names selected from the source, in column order.
    pub layers: Vec<String>,
    /// Pairwise |r| above which one predictor of the pair is dropped.
    pub collinearity_threshold: f64,
    /// Fraction of each class assigned to the training partition.
    pub train_proportion: f64,
    pub maxent: MaxentParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            seed: 42,
            force_recompute: false,
            species: "Bradypus variegatus".to_string(),
            occurrences: OccurrenceSourceConfig::Gbif {
                endpoint: "https://api.gbif.org/v1".to_string(),
                max_records: 1000,
                require_complete: false,
            },
            layer_source: LayerSourceConfig::Archive {
                path: PathBuf::from("data/raw/wc2.1_10m_bio.tar.gz"),
                url: None,
            },
            layers: ["bio_1", "bio_5", "bio_6", "bio_7", "bio_8", "bio_12", "bio_16", "bio_17"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            collinearity_threshold: 0.7,
            train_proportion: 0.8,
            maxent: MaxentParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file; absent fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| SdmError::io(path, e))?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(SdmError::InvalidConfig { message });
        if self.species.trim().is_empty() {
            return invalid("species must not be empty".into());
        }
        if self.layers.is_empty() {
            return invalid("at least one layer must be selected".into());
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.layers {
            if !seen.insert(name) {
                return invalid(format!("layer '{name}' listed twice"));
            }
        }
        if !(self.collinearity_threshold > 0.0 && self.collinearity_threshold <= 1.0) {
            return invalid(format!(
                "collinearity_threshold must be in (0, 1], got {}",
                self.collinearity_threshold
            ));
        }
        if !(self.train_proportion > 0.0 && self.train_proportion < 1.0) {
            return invalid(format!(
                "train_proportion must be in (0, 1), got {}",
                self.train_proportion
            ));
        }
        if let OccurrenceSourceConfig::Gbif { max_records, .. } = &self.occurrences {
            if *max_records == 0 {
                return invalid("max_records must be positive".into());
            }
        }
        self.maxent.validate()
    }
}
