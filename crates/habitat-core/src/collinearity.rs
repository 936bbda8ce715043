//! Collinearity reduction: drop one predictor of every pair whose |r| exceeds τ,
//! choosing the member with the higher variance inflation factor.
//!
//! Loop:
//!   1. |Pearson r| for all remaining pairs; stop when the maximum is ≤ τ.
//!   2. VIF of each remaining predictor (regressed on all other remaining ones).
//!   3. Drop the pair member with the larger VIF. Equal VIFs: larger mean |r|
//!      against the others goes; then the lexicographically greater name.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SdmError};
use crate::serde_float::null_as_inf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedPredictor {
    pub name: String,
    /// The predictor it was too correlated with (kept at that step).
    pub partner: String,
    /// Pearson r between the two.
    pub correlation: f64,
    #[serde(deserialize_with = "null_as_inf")]
    pub vif: f64,
    #[serde(deserialize_with = "null_as_inf")]
    pub partner_vif: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorVif {
    pub name: String,
    #[serde(deserialize_with = "null_as_inf")]
    pub vif: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollinearityReport {
    pub threshold: f64,
    /// Surviving predictors in input order.
    pub kept: Vec<String>,
    /// In drop order.
    pub dropped: Vec<DroppedPredictor>,
    /// VIFs of the survivors.
    pub final_vif: Vec<PredictorVif>,
    /// Largest |r| among the survivors.
    pub max_abs_correlation: f64,
    /// Complete-case rows the statistics were computed on.
    pub n_rows: usize,
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Pearson r; 0 when either series has no variance.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    if x.len() < 2 {
        return 0.0;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let num: f64 = x.iter().zip(y.iter()).map(|(&a, &b)| (a - mx) * (b - my)).sum();
    let vx = x.iter().map(|&a| (a - mx).powi(2)).sum::<f64>().sqrt();
    let vy = y.iter().map(|&b| (b - my).powi(2)).sum::<f64>().sqrt();
    if vx < 1e-12 || vy < 1e-12 {
        return 0.0;
    }
    (num / (vx * vy)).clamp(-1.0, 1.0)
}

pub fn correlation_matrix(columns: &[&[f64]]) -> Vec<Vec<f64>> {
    let p = columns.len();
    let mut r = vec![vec![0.0; p]; p];
    for i in 0..p {
        r[i][i] = 1.0;
        for j in i + 1..p {
            let v = pearson(columns[i], columns[j]);
            r[i][j] = v;
            r[j][i] = v;
        }
    }
    r
}

/// Solve `a · x = b` by Gaussian elimination with partial pivoting.
/// None when `a` is (numerically) singular.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let f = a[row][col] / a[col][col];
            if f == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let s: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - s) / a[row][row];
    }
    Some(x)
}

/// VIF_j = 1 / (1 − R²_j), R²_j from regressing predictor j on the others.
/// Computed from the correlation matrix: R²_j = r_jᵀ R₋ⱼ⁻¹ r_j.
pub fn vif_from_correlation(r: &[Vec<f64>]) -> Vec<f64> {
    let p = r.len();
    if p < 2 {
        return vec![1.0; p];
    }
    (0..p)
        .map(|j| {
            let others: Vec<usize> = (0..p).filter(|&k| k != j).collect();
            let a: Vec<Vec<f64>> = others.iter().map(|&i| others.iter().map(|&k| r[i][k]).collect()).collect();
            let b: Vec<f64> = others.iter().map(|&i| r[i][j]).collect();
            match solve(a, b.clone()) {
                Some(beta) => {
                    let r2: f64 = beta.iter().zip(&b).map(|(x, y)| x * y).sum();
                    if r2 >= 1.0 - 1e-12 {
                        f64::INFINITY
                    } else {
                        1.0 / (1.0 - r2.max(0.0))
                    }
                }
                None => f64::INFINITY,
            }
        })
        .collect()
}

pub fn vif(columns: &[&[f64]]) -> Vec<f64> {
    vif_from_correlation(&correlation_matrix(columns))
}

fn vifs_equal(a: f64, b: f64) -> bool {
    if a.is_infinite() && b.is_infinite() {
        return true;
    }
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

// ── Reduction ─────────────────────────────────────────────────────────────────

/// Prune `columns` (complete cases, one Vec per predictor, aligned rows) until no
/// remaining pair has |r| > `threshold`.
pub fn reduce_collinearity(names: &[String], columns: &[Vec<f64>], threshold: f64) -> Result<CollinearityReport> {
    if names.len() != columns.len() {
        return Err(SdmError::InvalidConfig {
            message: format!("{} predictor names for {} columns", names.len(), columns.len()),
        });
    }
    let n_rows = columns.first().map_or(0, Vec::len);
    let all: Vec<&[f64]> = columns.iter().map(Vec::as_slice).collect();
    let full_r = correlation_matrix(&all);

    let mut remaining: Vec<usize> = (0..names.len()).collect();
    let mut dropped = Vec::new();
    let max_iterations = names.len();

    for _ in 0..=max_iterations {
        // Highest |r| among remaining pairs (first pair wins exact ties).
        let mut best: Option<(usize, usize, f64)> = None;
        for (a, &i) in remaining.iter().enumerate() {
            for &j in &remaining[a + 1..] {
                let v = full_r[i][j].abs();
                if best.map_or(true, |(_, _, b)| v > b) {
                    best = Some((i, j, v));
                }
            }
        }
        let Some((i, j, max_r)) = best.filter(|&(_, _, v)| v > threshold) else {
            return Ok(finish(names, &full_r, &all, remaining, dropped, threshold, n_rows));
        };

        let sub: Vec<Vec<f64>> = remaining
            .iter()
            .map(|&a| remaining.iter().map(|&b| full_r[a][b]).collect())
            .collect();
        let vifs = vif_from_correlation(&sub);
        let pos = |k: usize| remaining.iter().position(|&x| x == k).unwrap_or_default();
        let (vi, vj) = (vifs[pos(i)], vifs[pos(j)]);

        let drop_i = if vifs_equal(vi, vj) {
            let mean_abs_r = |k: usize| {
                let s: f64 = remaining.iter().filter(|&&o| o != k).map(|&o| full_r[k][o].abs()).sum();
                s / (remaining.len() - 1) as f64
            };
            let (mi, mj) = (mean_abs_r(i), mean_abs_r(j));
            if (mi - mj).abs() > 1e-12 {
                mi > mj
            } else {
                names[i] > names[j]
            }
        } else {
            vi > vj
        };
        let (gone, stay, v_gone, v_stay) = if drop_i { (i, j, vi, vj) } else { (j, i, vj, vi) };

        debug!(
            "|r({}, {})| = {max_r:.3} > {threshold}: dropping {} (VIF {v_gone:.2} vs {v_stay:.2})",
            names[i], names[j], names[gone]
        );
        dropped.push(DroppedPredictor {
            name: names[gone].clone(),
            partner: names[stay].clone(),
            correlation: full_r[gone][stay],
            vif: v_gone,
            partner_vif: v_stay,
        });
        remaining.retain(|&k| k != gone);
    }

    Err(SdmError::CollinearityNotConverged { iterations: max_iterations })
}

fn finish(
    names: &[String],
    full_r: &[Vec<f64>],
    all: &[&[f64]],
    remaining: Vec<usize>,
    dropped: Vec<DroppedPredictor>,
    threshold: f64,
    n_rows: usize,
) -> CollinearityReport {
    let kept_cols: Vec<&[f64]> = remaining.iter().map(|&k| all[k]).collect();
    let final_vif = remaining
        .iter()
        .zip(vif(&kept_cols))
        .map(|(&k, v)| PredictorVif { name: names[k].clone(), vif: v })
        .collect();
    let mut max_abs_correlation = 0.0f64;
    for (a, &i) in remaining.iter().enumerate() {
        for &j in &remaining[a + 1..] {
            max_abs_correlation = max_abs_correlation.max(full_r[i][j].abs());
        }
    }
    info!(
        "collinearity: kept {} of {} predictors (max |r| {max_abs_correlation:.3})",
        remaining.len(),
        names.len()
    );
    CollinearityReport {
        threshold,
        kept: remaining.iter().map(|&k| names[k].clone()).collect(),
        dropped,
        final_vif,
        max_abs_correlation,
        n_rows,
    }
}
