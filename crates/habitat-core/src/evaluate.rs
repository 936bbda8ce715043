//! Hold-out evaluation: stratified split, ROC/AUC, threshold and confusion rates.

use log::info;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SdmError};
use crate::features::FeatureTable;
use crate::labeled::LabeledPoint;
use crate::model::Scorer;
use crate::serde_float::null_as_inf;

/// Point ids assigned to each partition, both sorted ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Split each class independently so both partitions keep the class ratio.
///
/// A class with at least two points always contributes one point to each side.
pub fn stratified_split<R: Rng + ?Sized>(points: &[LabeledPoint], train_proportion: f64, rng: &mut R) -> DataSplit {
    let mut train = Vec::new();
    let mut test = Vec::new();
    for label in [1u8, 0u8] {
        let mut ids: Vec<usize> = points.iter().filter(|p| p.label == label).map(|p| p.id).collect();
        ids.shuffle(rng);
        let n = ids.len();
        let mut n_train = (n as f64 * train_proportion).round() as usize;
        if n >= 2 {
            n_train = n_train.clamp(1, n - 1);
        }
        let n_train = n_train.min(n);
        train.extend_from_slice(&ids[..n_train]);
        test.extend_from_slice(&ids[n_train..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    DataSplit { train, test }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RocPoint {
    /// Scores ≥ this are called presence. +∞ for the origin.
    #[serde(deserialize_with = "null_as_inf")]
    pub threshold: f64,
    pub fpr: f64,
    pub tpr: f64,
}

/// ROC curve from (0,0) to (1,1), one point per distinct score, highest first.
/// Both classes must be present.
pub fn roc_curve(scores: &[f64], labels: &[u8]) -> Vec<RocPoint> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    let pos = labels.iter().filter(|&&l| l == 1).count() as f64;
    let neg = labels.len() as f64 - pos;

    let mut curve = vec![RocPoint { threshold: f64::INFINITY, fpr: 0.0, tpr: 0.0 }];
    let (mut tp, mut fp) = (0.0, 0.0);
    let mut i = 0;
    while i < order.len() {
        let s = scores[order[i]];
        // Tied scores move the curve in a single step.
        while i < order.len() && scores[order[i]] == s {
            if labels[order[i]] == 1 {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
            i += 1;
        }
        curve.push(RocPoint { threshold: s, fpr: fp / neg, tpr: tp / pos });
    }
    curve
}

/// Trapezoidal area under the curve.
pub fn auc(curve: &[RocPoint]) -> f64 {
    curve
        .windows(2)
        .map(|w| (w[1].fpr - w[0].fpr) * (w[1].tpr + w[0].tpr) / 2.0)
        .sum()
}

/// Curve point maximising sensitivity + specificity; the highest threshold wins ties.
pub fn best_threshold(curve: &[RocPoint]) -> Option<RocPoint> {
    let mut best: Option<RocPoint> = None;
    for p in curve.iter().filter(|p| p.threshold.is_finite()) {
        if best.map_or(true, |b| p.tpr - p.fpr > b.tpr - b.fpr) {
            best = Some(*p);
        }
    }
    best
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confusion {
    pub tp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub fp: usize,
    pub tn: usize,
}

impl Confusion {
    pub fn from_scores(scores: &[f64], labels: &[u8], threshold: f64) -> Self {
        let mut c = Confusion::default();
        for (&s, &l) in scores.iter().zip(labels) {
            match (l == 1, s >= threshold) {
                (true, true) => c.tp += 1,
                (true, false) => c.fn_ += 1,
                (false, true) => c.fp += 1,
                (false, false) => c.tn += 1,
            }
        }
        c
    }

    pub fn tpr(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }
    pub fn fnr(&self) -> f64 {
        ratio(self.fn_, self.tp + self.fn_)
    }
    pub fn fpr(&self) -> f64 {
        ratio(self.fp, self.fp + self.tn)
    }
    pub fn tnr(&self) -> f64 {
        ratio(self.tn, self.fp + self.tn)
    }
}

fn ratio(a: usize, b: usize) -> f64 {
    if b == 0 {
        0.0
    } else {
        a as f64 / b as f64
    }
}

/// Persisted as `evaluation.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub auc: f64,
    pub threshold: f64,
    pub tpr: f64,
    pub fnr: f64,
    pub fpr: f64,
    pub tnr: f64,
    pub confusion: Confusion,
    pub n_test_presences: usize,
    pub n_test_absences: usize,
    /// Test rows skipped for missing predictor values.
    pub n_skipped: usize,
    pub roc: Vec<RocPoint>,
}

/// Compute the report from already-scored test points.
pub fn evaluate_scores(scores: &[f64], labels: &[u8]) -> Result<EvaluationReport> {
    let presences = labels.iter().filter(|&&l| l == 1).count();
    let absences = labels.len() - presences;
    if presences == 0 || absences == 0 {
        return Err(SdmError::EmptyClass { presences, absences });
    }
    let roc = roc_curve(scores, labels);
    let area = auc(&roc);
    let threshold = best_threshold(&roc).map_or(f64::INFINITY, |p| p.threshold);
    let confusion = Confusion::from_scores(scores, labels, threshold);
    Ok(EvaluationReport {
        auc: area,
        threshold,
        tpr: confusion.tpr(),
        fnr: confusion.fnr(),
        fpr: confusion.fpr(),
        tnr: confusion.tnr(),
        confusion,
        n_test_presences: presences,
        n_test_absences: absences,
        n_skipped: 0,
        roc,
    })
}

/// Score the test partition of `table` and evaluate. Rows with missing
/// predictors cannot be scored and are left out.
pub fn evaluate_model<M: Scorer>(model: &M, table: &FeatureTable, split: &DataSplit) -> Result<EvaluationReport> {
    let table = table.select(model.predictors())?;
    let test: std::collections::HashSet<usize> = split.test.iter().copied().collect();
    let mut scores = Vec::new();
    let mut labels = Vec::new();
    let mut skipped = 0;
    for r in table.rows.iter().filter(|r| test.contains(&r.id)) {
        let s = model.score(&r.values);
        if s.is_finite() {
            scores.push(s);
            labels.push(r.label);
        } else {
            skipped += 1;
        }
    }
    let mut report = evaluate_scores(&scores, &labels)?;
    report.n_skipped = skipped;
    info!(
        "AUC {:.3}, threshold {:.4}, TPR {:.3}, TNR {:.3} on {} test points",
        report.auc,
        report.threshold,
        report.tpr,
        report.tnr,
        scores.len()
    );
    Ok(report)
}
