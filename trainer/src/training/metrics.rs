//! Concordance index and per-epoch ranking metrics.
//!
//! Batch results are averaged with equal weight per batch, not per pair.

use serde::{Deserialize, Serialize};

/// Logistic function.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Fraction of pairs whose thresholded `sigmoid(diff)` matches the label.
///
/// A pair is predicted as class 1 when `sigmoid(diff) >= 0.5`.
/// Returns 0.0 for an empty slice.
pub fn concordance_index(diffs: &[f32], labels: &[f32]) -> f64 {
    assert_eq!(
        diffs.len(),
        labels.len(),
        "diffs and labels must have same length"
    );
    if diffs.is_empty() {
        return 0.0;
    }
    let correct = diffs
        .iter()
        .zip(labels.iter())
        .filter(|(&d, &label)| {
            let predicted = if sigmoid(d) < 0.5 { 0.0 } else { 1.0 };
            predicted == label
        })
        .count();
    correct as f64 / diffs.len() as f64
}

/// Per-batch loss and CI, reduced to equal-weighted means at epoch end.
#[derive(Debug, Clone, Default)]
pub struct BatchAccumulator {
    losses: Vec<f64>,
    cis: Vec<f64>,
}

impl BatchAccumulator {
    pub fn push(&mut self, loss: f64, ci: f64) {
        self.losses.push(loss);
        self.cis.push(ci);
    }

    pub fn batches(&self) -> usize {
        self.losses.len()
    }

    pub fn mean_loss(&self) -> f64 {
        mean(&self.losses)
    }

    pub fn mean_ci(&self) -> f64 {
        mean(&self.cis)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Metrics emitted after each training pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainEpochMetrics {
    pub epoch: usize,
    pub avg_loss: f64,
    pub train_ci: f64,
    pub batches: usize,
    pub t_steps: usize,
    pub lr: f64,
}

/// Metrics emitted after each validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEpochMetrics {
    pub epoch: usize,
    pub val_loss: f64,
    pub val_ci: f64,
    pub best_loss: f64,
    pub best_val_ci: f64,
    /// This epoch replaced the best-so-far CI.
    pub improved: bool,
    pub t_steps: usize,
}

/// Audit entry recorded at every validation epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvEntry {
    #[serde(rename = "CI")]
    pub ci: f64,
    pub t_steps: usize,
}

/// Best-so-far validation CI and the loss observed with it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestScore {
    pub ci: f64,
    pub loss: f64,
}

/// Validation bookkeeping kept for the whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunningMetrics {
    best: Option<BestScore>,
    cvdata: Vec<CvEntry>,
}

impl RunningMetrics {
    /// Record one validation epoch and return whether the best was updated.
    ///
    /// Ties go to the newer epoch: the best is replaced when
    /// `ci >= best.ci`.
    pub fn record_validation(&mut self, ci: f64, loss: f64, t_steps: usize) -> bool {
        self.cvdata.push(CvEntry { ci, t_steps });
        let improved = match self.best {
            None => true,
            Some(best) => best.ci <= ci,
        };
        if improved {
            self.best = Some(BestScore { ci, loss });
        }
        improved
    }

    pub fn best(&self) -> Option<BestScore> {
        self.best
    }

    pub fn cvdata(&self) -> &[CvEntry] {
        &self.cvdata
    }
}

impl std::fmt::Display for TrainEpochMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "avg_loss={:.4} train_CI={:.4} (batches={} t_steps={} lr={:.2e})",
            self.avg_loss, self.train_ci, self.batches, self.t_steps, self.lr,
        )
    }
}

impl std::fmt::Display for ValidationEpochMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "val_loss={:.4} val_ci={:.4} best_loss={:.4} best_val_ci={:.4}{}",
            self.val_loss,
            self.val_ci,
            self.best_loss,
            self.best_val_ci,
            if self.improved { " *" } else { "" },
        )
    }
}
