//! Error type shared by every pipeline stage.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, SdmError>;

#[derive(Debug, Error)]
pub enum SdmError {
    /// Transport failure or non-success status from an upstream data source.
    #[error("HTTP error: {message}")]
    Http { message: String },

    /// Upstream asked us to back off.
    #[error("Rate limited by {source_name} (HTTP 429)")]
    RateLimited { source_name: String },

    /// The occurrence query succeeded but returned nothing usable.
    #[error("No occurrence records with coordinates for species '{species}'")]
    NoOccurrences { species: String },

    /// The record cap ended paging while the source still had more records.
    #[error("Occurrence download for '{species}' stopped at {fetched} of {available} records (raise max_records)")]
    Truncated { species: String, fetched: usize, available: usize },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TIFF error in {path}: {message}")]
    Tiff { path: PathBuf, message: String },

    #[error("Layer '{name}' not found in {source_desc}")]
    MissingLayer { name: String, source_desc: String },

    /// Two layers of one stack disagree on extent or resolution.
    #[error("Layer '{name}' does not share the stack grid: {detail}")]
    GridMismatch { name: String, detail: String },

    #[error("Cannot build a convex hull from {points} distinct non-collinear points")]
    DegenerateHull { points: usize },

    #[error("Requested {requested} pseudo-absence points but only {available} valid empty cells exist")]
    InsufficientCells { requested: usize, available: usize },

    /// Background sampling must match the presence count one for one.
    #[error("Labeled set needs equal class sizes: {presences} presences vs {background} background points")]
    CountMismatch { presences: usize, background: usize },

    #[error("Evaluation needs both classes in the test set (presences: {presences}, absences: {absences})")]
    EmptyClass { presences: usize, absences: usize },

    #[error("Collinearity reduction did not converge after {iterations} iterations")]
    CollinearityNotConverged { iterations: usize },

    #[error("Model fitting failed: {message}")]
    Fit { message: String },

    #[error("Corrupt artifact {path}: {message}")]
    CorruptArtifact { path: PathBuf, message: String },

    #[error("Schema mismatch in {path}: expected {expected}, found {found}")]
    SchemaMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl SdmError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn tiff(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Tiff { path: path.into(), message: err.to_string() }
    }

    pub fn corrupt(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::CorruptArtifact { path: path.into(), message: err.to_string() }
    }
}
