//! serde_json writes non-finite floats as `null`; these read them back.

use serde::{Deserialize, Deserializer};

/// `null` → NaN (missing raster cells).
pub(crate) fn null_as_nan_vec<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f32>, D::Error> {
    let v: Vec<Option<f32>> = Vec::deserialize(d)?;
    Ok(v.into_iter().map(|x| x.unwrap_or(f32::NAN)).collect())
}

/// `null` → +∞ (perfect collinearity, ROC start threshold).
pub(crate) fn null_as_inf<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::INFINITY))
}
