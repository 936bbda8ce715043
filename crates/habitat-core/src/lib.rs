//! Species distribution modelling from presence records and gridded predictors.
//!
//! Pipeline:
//!   occurrences → convex-hull study area → background sample → labeled set →
//!   features → collinearity reduction → split → maxent fit → evaluation →
//!   suitability map.
//!
//! Every stage writes an artifact to the data directory and is skipped on the
//! next run while its inputs are unchanged (see [`cache`]).

pub mod cache;
pub mod collinearity;
pub mod config;
pub mod coords;
pub mod error;
pub mod evaluate;
pub mod features;
pub mod hull;
pub mod labeled;
pub mod layers;
pub mod model;
pub mod occurrence;
pub mod pipeline;
pub mod raster;
pub mod sampler;

mod serde_float;

pub use config::PipelineConfig;
pub use error::{Result, SdmError};
pub use pipeline::{Pipeline, PipelineRun};
