//! Maximum-entropy presence/background model.
//!
//! Fits a Gibbs distribution `p(x) ∝ exp(λ·f(x))` over the background points so
//! that feature expectations match the presence means within L1 bounds
//! `β_j = β·σ_j/√m`. Features are the predictors and (optionally) their squares,
//! each scaled to [0,1] by the training range. Output is the complementary
//! log-log transform `1 - exp(-exp(H + λ·f - ln Z))`, which lies in [0,1].

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{Scorer, Trainer};
use crate::error::{Result, SdmError};

/// Floor on the presence standard deviation used in the regularisation bound.
const MIN_SD: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxentParams {
    /// Multiplier on every per-feature L1 bound.
    pub regularization: f64,
    /// Add squared predictor features.
    pub quadratic: bool,
    /// Include presence points in the background sample.
    pub add_presences_to_background: bool,
    pub max_iterations: usize,
    /// Stop when no weight moves by more than this in one step.
    pub tolerance: f64,
}

impl Default for MaxentParams {
    fn default() -> Self {
        Self {
            regularization: 1.0,
            quadratic: true,
            add_presences_to_background: true,
            max_iterations: 2000,
            tolerance: 1e-6,
        }
    }
}

impl MaxentParams {
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(SdmError::InvalidConfig { message });
        if !(self.regularization.is_finite() && self.regularization >= 0.0) {
            return invalid(format!("maxent.regularization must be >= 0, got {}", self.regularization));
        }
        if self.max_iterations == 0 {
            return invalid("maxent.max_iterations must be positive".into());
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return invalid(format!("maxent.tolerance must be > 0, got {}", self.tolerance));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaxentTrainer {
    pub params: MaxentParams,
}

impl MaxentTrainer {
    pub fn new(params: MaxentParams) -> Self {
        Self { params }
    }
}

/// Fitted model. Serialised as the `model.json` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaxentModel {
    pub predictors: Vec<String>,
    /// Training range per predictor; inputs are clamped to it.
    pub mins: Vec<f64>,
    pub maxs: Vec<f64>,
    pub quadratic: bool,
    /// Linear weights first, then quadratic weights when enabled.
    pub weights: Vec<f64>,
    /// ln Z over the background sample.
    pub log_normalizer: f64,
    /// Entropy of the fitted background distribution.
    pub entropy: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl MaxentModel {
    fn feature_count(&self) -> usize {
        if self.quadratic {
            2 * self.predictors.len()
        } else {
            self.predictors.len()
        }
    }

    /// Clamp, scale to [0,1], append squares.
    fn features(&self, x: &[f64]) -> Vec<f64> {
        let mut f: Vec<f64> = x
            .iter()
            .zip(self.mins.iter().zip(&self.maxs))
            .map(|(&v, (&lo, &hi))| {
                let range = hi - lo;
                if range > 0.0 {
                    (v.clamp(lo, hi) - lo) / range
                } else {
                    0.0
                }
            })
            .collect();
        if self.quadratic {
            let squares: Vec<f64> = f.iter().map(|v| v * v).collect();
            f.extend(squares);
        }
        f
    }

    /// `λ·f(x)`.
    pub fn linear_predictor(&self, x: &[f64]) -> f64 {
        dot(&self.weights, &self.features(x))
    }

    pub fn cloglog(&self, x: &[f64]) -> f64 {
        let eta = self.entropy + self.linear_predictor(x) - self.log_normalizer;
        1.0 - (-eta.exp()).exp()
    }

    /// Features with a non-zero weight.
    pub fn active_features(&self) -> usize {
        self.weights.iter().filter(|w| **w != 0.0).count()
    }
}

impl Scorer for MaxentModel {
    fn predictors(&self) -> &[String] {
        &self.predictors
    }

    fn score(&self, features: &[f64]) -> f64 {
        if features.len() != self.predictors.len() || features.iter().any(|v| !v.is_finite()) {
            return f64::NAN;
        }
        self.cloglog(features)
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn soft_threshold(v: f64, t: f64) -> f64 {
    if v > t {
        v - t
    } else if v < -t {
        v + t
    } else {
        0.0
    }
}

/// Background weights `exp(s_i)/Z` and `ln Z` for scores `s_i = λ·f_i`.
fn gibbs(background: &[Vec<f64>], lambda: &[f64]) -> (Vec<f64>, Vec<f64>, f64) {
    let scores: Vec<f64> = background.iter().map(|f| dot(lambda, f)).collect();
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let sum: f64 = scores.iter().map(|s| (s - max).exp()).sum();
    let log_z = max + sum.ln();
    let weights = scores.iter().map(|s| (s - log_z).exp()).collect();
    (weights, scores, log_z)
}

impl Trainer for MaxentTrainer {
    type Model = MaxentModel;

    fn name(&self) -> &'static str {
        "maxent"
    }

    fn settings(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.params)?)
    }

    fn fit(&self, predictors: &[String], rows: &[Vec<f64>], labels: &[u8]) -> Result<MaxentModel> {
        let fail = |message: String| Err(SdmError::Fit { message });
        let p = predictors.len();
        if p == 0 {
            return fail("no predictors".into());
        }
        if rows.len() != labels.len() {
            return fail(format!("{} rows but {} labels", rows.len(), labels.len()));
        }
        if let Some(bad) = rows.iter().position(|r| r.len() != p || r.iter().any(|v| !v.is_finite())) {
            return fail(format!("row {bad} is incomplete or has the wrong width"));
        }

        let presence: Vec<&Vec<f64>> = rows.iter().zip(labels).filter(|(_, &l)| l == 1).map(|(r, _)| r).collect();
        let mut background: Vec<&Vec<f64>> =
            rows.iter().zip(labels).filter(|(_, &l)| l == 0).map(|(r, _)| r).collect();
        if self.params.add_presences_to_background {
            background.extend(presence.iter().copied());
        }
        if presence.len() < 2 || background.is_empty() {
            return fail(format!(
                "need at least 2 presences and 1 background point, got {} and {}",
                presence.len(),
                background.len()
            ));
        }

        let mut mins = vec![f64::INFINITY; p];
        let mut maxs = vec![f64::NEG_INFINITY; p];
        for r in rows {
            for j in 0..p {
                mins[j] = mins[j].min(r[j]);
                maxs[j] = maxs[j].max(r[j]);
            }
        }

        let mut model = MaxentModel {
            predictors: predictors.to_vec(),
            mins,
            maxs,
            quadratic: self.params.quadratic,
            weights: Vec::new(),
            log_normalizer: 0.0,
            entropy: 0.0,
            iterations: 0,
            converged: false,
        };
        let d = model.feature_count();
        let pres_f: Vec<Vec<f64>> = presence.iter().map(|r| model.features(r)).collect();
        let bg_f: Vec<Vec<f64>> = background.iter().map(|r| model.features(r)).collect();

        let m = pres_f.len() as f64;
        let mean: Vec<f64> = (0..d).map(|j| pres_f.iter().map(|f| f[j]).sum::<f64>() / m).collect();
        let beta: Vec<f64> = (0..d)
            .map(|j| {
                let var = pres_f.iter().map(|f| (f[j] - mean[j]).powi(2)).sum::<f64>() / m;
                self.params.regularization * var.sqrt().max(MIN_SD) / m.sqrt()
            })
            .collect();

        // Features lie in [0,1], so the log-partition Hessian is bounded by d/4.
        let step = 4.0 / d as f64;
        let mut lambda = vec![0.0; d];
        for it in 0..self.params.max_iterations {
            let (w, _, _) = gibbs(&bg_f, &lambda);
            let mut delta = 0.0f64;
            for j in 0..d {
                let expected: f64 = w.iter().zip(&bg_f).map(|(wi, f)| wi * f[j]).sum();
                let next = soft_threshold(lambda[j] - step * (expected - mean[j]), step * beta[j]);
                delta = delta.max((next - lambda[j]).abs());
                lambda[j] = next;
            }
            model.iterations = it + 1;
            if delta < self.params.tolerance {
                model.converged = true;
                break;
            }
        }
        if !model.converged {
            debug!("maxent stopped at the iteration cap ({})", self.params.max_iterations);
        }

        let (w, scores, log_z) = gibbs(&bg_f, &lambda);
        model.entropy = log_z - dot(&w, &scores);
        model.log_normalizer = log_z;
        model.weights = lambda;
        info!(
            "maxent: {} presences, {} background, {}/{} active features after {} iterations",
            presence.len(),
            background.len(),
            model.active_features(),
            d,
            model.iterations
        );
        Ok(model)
    }
}
