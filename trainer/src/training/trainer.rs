//! Training/validation state machine for the ranking network.
//!
//! A run moves `Initialized → (train epoch → validation epoch)* → Finished`.
//! [`Trainer::train_epoch`] and [`Trainer::validate_epoch`] each advance an
//! explicit [`TrainState`]; [`Trainer::run`] drives them and consults the
//! stopping rules at validation boundaries. Side effects beyond logging go
//! through an [`EpochObserver`] passed in by the caller.

use super::data::{train_val_split, DatasetMode, PairedDataset, SampleTable};
use super::loader::{LoaderConfig, PairBatch, PairLoader};
use super::metrics::{
    concordance_index, BatchAccumulator, CvEntry, RunningMetrics, TrainEpochMetrics,
    ValidationEpochMetrics,
};
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use cinet_core::{CinetError, NetworkConfig, Result, Stage, TrainingSettings};
use cinet_model::RankingNetwork;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the best-CI parameter snapshot.
pub const BEST_CHECKPOINT: &str = "best.safetensors";

/// Why a run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxEpochs,
    MaxSteps,
    EarlyStopping,
}

/// Lifecycle position of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialized,
    Running,
    Finished(StopReason),
}

/// Everything a run accumulates between epochs.
#[derive(Debug, Clone)]
pub struct TrainState {
    pub phase: Phase,
    /// Completed training epochs.
    pub epoch: usize,
    /// Cumulative optimizer steps.
    pub t_steps: usize,
    pub running: RunningMetrics,
    pub train_history: Vec<TrainEpochMetrics>,
    pub val_history: Vec<ValidationEpochMetrics>,
}

impl Default for TrainState {
    fn default() -> Self {
        Self {
            phase: Phase::Initialized,
            epoch: 0,
            t_steps: 0,
            running: RunningMetrics::default(),
            train_history: Vec::new(),
            val_history: Vec::new(),
        }
    }
}

/// Callbacks invoked after each epoch.
pub trait EpochObserver {
    fn on_train_epoch(&mut self, _metrics: &TrainEpochMetrics) -> Result<()> {
        Ok(())
    }

    fn on_validation_epoch(
        &mut self,
        _network: &RankingNetwork,
        _metrics: &ValidationEpochMetrics,
    ) -> Result<()> {
        Ok(())
    }
}

impl EpochObserver for () {}

/// Writes `best.safetensors` whenever validation CI reaches a new best.
pub struct Checkpointer {
    dir: PathBuf,
}

impl Checkpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_CHECKPOINT)
    }
}

impl EpochObserver for Checkpointer {
    fn on_validation_epoch(
        &mut self,
        network: &RankingNetwork,
        metrics: &ValidationEpochMetrics,
    ) -> Result<()> {
        if metrics.improved {
            let path = self.best_path();
            network.save(&path)?;
            tracing::debug!(path = %path.display(), epoch = metrics.epoch, "Saved best checkpoint");
        }
        Ok(())
    }
}

/// Multi-step learning-rate schedule: `lr * gamma^k` where `k` counts the
/// milestones already reached.
#[derive(Debug, Clone)]
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: &[usize], gamma: f64) -> Self {
        let mut milestones = milestones.to_vec();
        milestones.sort_unstable();
        Self {
            base_lr,
            milestones,
            gamma,
        }
    }

    /// Learning rate for the zero-based `epoch`.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let reached = self.milestones.iter().filter(|&&m| m <= epoch).count();
        self.base_lr * self.gamma.powi(reached as i32)
    }
}

/// Patience-based early stopping on validation CI (maximised).
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: Option<usize>,
    min_epochs: usize,
    best: Option<f64>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: Option<usize>, min_epochs: usize) -> Self {
        Self {
            patience,
            min_epochs,
            best: None,
            wait: 0,
        }
    }

    /// Feed the CI of `epoch` (one-based) and return whether to stop.
    pub fn should_stop(&mut self, val_ci: f64, epoch: usize) -> bool {
        match self.best {
            Some(best) if val_ci <= best => self.wait += 1,
            _ => {
                self.best = Some(val_ci);
                self.wait = 0;
            }
        }
        match self.patience {
            Some(patience) => epoch >= self.min_epochs && self.wait >= patience,
            None => false,
        }
    }
}

/// Margin ranking loss against a zero reference with zero margin:
/// `mean(max(0, -y * diff))`, `y = 2 * label - 1`.
fn ranking_loss(diff: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    let target = labels.affine(2.0, -1.0)?;
    target.mul(diff)?.neg()?.relu()?.mean_all()
}

fn tensor_err(context: &'static str) -> impl Fn(candle_core::Error) -> CinetError {
    move |e| CinetError::Model(format!("{context}: {e}"))
}

/// Owns the network, optimizer and loaders of one run.
pub struct Trainer {
    network: RankingNetwork,
    optimizer: AdamW,
    schedule: MultiStepLr,
    stopping: EarlyStopping,
    train_loader: PairLoader,
    val_loader: PairLoader,
    max_epochs: usize,
    max_steps: Option<usize>,
}

impl Trainer {
    /// Set up a run. Fails before any epoch when either loader is empty.
    pub fn new(
        network: RankingNetwork,
        train_loader: PairLoader,
        val_loader: PairLoader,
        settings: &TrainingSettings,
    ) -> Result<Self> {
        if train_loader.dataset().is_empty() {
            return Err(CinetError::Config(
                "training subset produced zero pairs".to_string(),
            ));
        }
        if val_loader.dataset().is_empty() {
            return Err(CinetError::Config(
                "validation subset produced zero pairs".to_string(),
            ));
        }
        if settings.max_epochs == 0 {
            return Err(CinetError::Config("max_epochs must be non-zero".to_string()));
        }

        let lr = network.config().lr;
        let optimizer = AdamW::new(
            network.trainable_vars()?,
            ParamsAdamW {
                lr,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .map_err(tensor_err("Failed to create optimizer"))?;

        Ok(Self {
            network,
            optimizer,
            schedule: MultiStepLr::new(lr, &settings.sc_milestones, settings.sc_gamma),
            stopping: EarlyStopping::new(settings.patience, settings.min_epochs),
            train_loader,
            val_loader,
            max_epochs: settings.max_epochs,
            max_steps: settings.max_steps,
        })
    }

    fn budget_spent(&self, t_steps: usize) -> bool {
        self.max_steps.is_some_and(|max| t_steps >= max)
    }

    /// One pass over the training pairs with optimizer updates.
    pub fn train_epoch(&mut self, state: &mut TrainState) -> Result<TrainEpochMetrics> {
        state.phase = Phase::Running;
        let epoch = state.epoch + 1;
        let lr = self.schedule.lr_at(state.epoch);
        self.optimizer.set_learning_rate(lr);

        let mut acc = BatchAccumulator::default();
        for batch in self.train_loader.epoch(state.epoch) {
            if self.max_steps.is_some_and(|max| state.t_steps >= max) {
                break;
            }
            let batch = batch?;
            let at = StepContext {
                stage: Stage::Training,
                epoch,
                step: state.t_steps,
            };
            let step = pair_step(&self.network, &batch, true, at)?;

            self.optimizer
                .backward_step(&step.loss)
                .map_err(tensor_err("Backward step failed"))?;
            state.t_steps += 1;

            acc.push(step.loss_val, step.ci);
        }

        let metrics = TrainEpochMetrics {
            epoch,
            avg_loss: acc.mean_loss(),
            train_ci: acc.mean_ci(),
            batches: acc.batches(),
            t_steps: state.t_steps,
            lr,
        };
        tracing::info!(
            epoch,
            train_loss = metrics.avg_loss,
            train_ci = metrics.train_ci,
            t_steps = state.t_steps,
            lr,
            "Training epoch finished"
        );
        state.train_history.push(metrics.clone());
        Ok(metrics)
    }

    /// One pass over the validation pairs in evaluation mode, followed by
    /// the best-CI update and the audit entry.
    pub fn validate_epoch(&self, state: &mut TrainState) -> Result<ValidationEpochMetrics> {
        let epoch = state.epoch + 1;
        let mut acc = BatchAccumulator::default();
        for batch in self.val_loader.epoch(state.epoch) {
            let batch = batch?;
            let at = StepContext {
                stage: Stage::Validation,
                epoch,
                step: state.t_steps,
            };
            let step = pair_step(&self.network, &batch, false, at)?;
            acc.push(step.loss_val, step.ci);
        }

        let val_loss = acc.mean_loss();
        let val_ci = acc.mean_ci();
        let improved = state.running.record_validation(val_ci, val_loss, state.t_steps);
        let best = state
            .running
            .best()
            .ok_or_else(|| CinetError::Model("best score missing after validation".to_string()))?;

        let metrics = ValidationEpochMetrics {
            epoch,
            val_loss,
            val_ci,
            best_loss: best.loss,
            best_val_ci: best.ci,
            improved,
            t_steps: state.t_steps,
        };
        tracing::info!(
            epoch,
            val_loss,
            val_ci,
            best_val_ci = best.ci,
            best_loss = best.loss,
            t_steps = state.t_steps,
            "Validation epoch finished"
        );
        state.val_history.push(metrics.clone());
        state.epoch += 1;
        Ok(metrics)
    }

    /// Drive epochs until a budget or the early-stopping rule ends the run.
    pub fn run(&mut self, observer: &mut dyn EpochObserver) -> Result<TrainState> {
        let mut state = TrainState::default();
        tracing::info!(
            train_pairs = self.train_loader.dataset().len(),
            val_pairs = self.val_loader.dataset().len(),
            batches = self.train_loader.num_batches(),
            max_epochs = self.max_epochs,
            "Starting training"
        );

        loop {
            let train = self.train_epoch(&mut state)?;
            observer.on_train_epoch(&train)?;
            let val = self.validate_epoch(&mut state)?;
            observer.on_validation_epoch(&self.network, &val)?;

            let stop = if self.stopping.should_stop(val.val_ci, val.epoch) {
                Some(StopReason::EarlyStopping)
            } else if self.budget_spent(state.t_steps) {
                Some(StopReason::MaxSteps)
            } else if state.epoch >= self.max_epochs {
                Some(StopReason::MaxEpochs)
            } else {
                None
            };
            if let Some(reason) = stop {
                tracing::info!(epoch = state.epoch, ?reason, "Training finished");
                state.phase = Phase::Finished(reason);
                return Ok(state);
            }
        }
    }
}

/// Where a batch was evaluated, for numeric failure reports.
#[derive(Debug, Clone, Copy)]
struct StepContext {
    stage: Stage,
    epoch: usize,
    step: usize,
}

impl StepContext {
    fn instability(self, value: f64) -> CinetError {
        CinetError::NumericInstability {
            stage: self.stage,
            epoch: self.epoch,
            step: self.step,
            value,
        }
    }
}

/// Loss tensor plus the host-side values of one evaluated batch.
struct PairStep {
    loss: Tensor,
    loss_val: f64,
    ci: f64,
}

/// Forward one batch, check it is finite, and compute loss and CI.
///
/// The hinge clamps NaN to zero, so pair differences are checked before
/// the loss.
fn pair_step(
    network: &RankingNetwork,
    batch: &PairBatch,
    train: bool,
    at: StepContext,
) -> Result<PairStep> {
    let diff = network.forward_pair(&batch.gene_a, &batch.gene_b, train)?;
    let diffs: Vec<f32> = diff.to_vec1().map_err(tensor_err("Reading differences failed"))?;
    ensure_finite(&diffs, at)?;

    let mut loss = ranking_loss(&diff, &batch.labels).map_err(tensor_err("Ranking loss failed"))?;
    if let Some(penalty) = network.regularization_penalty()? {
        loss = loss.add(&penalty).map_err(tensor_err("Adding penalty failed"))?;
    }
    let loss_val = loss
        .to_scalar::<f32>()
        .map_err(tensor_err("Loss scalar failed"))? as f64;
    if !loss_val.is_finite() {
        return Err(at.instability(loss_val));
    }

    let labels: Vec<f32> = batch
        .labels
        .to_vec1()
        .map_err(tensor_err("Reading labels failed"))?;
    Ok(PairStep {
        loss,
        loss_val,
        ci: concordance_index(&diffs, &labels),
    })
}

fn ensure_finite(diffs: &[f32], at: StepContext) -> Result<()> {
    match diffs.iter().find(|d| !d.is_finite()) {
        Some(&bad) => Err(at.instability(f64::from(bad))),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Trial entry point
// ---------------------------------------------------------------------------

/// Serializable summary of one trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialReport {
    pub config: NetworkConfig,
    pub parameter_count: usize,
    pub train_samples: usize,
    pub val_samples: usize,
    pub train_pairs: usize,
    pub val_pairs: usize,
    pub epochs: usize,
    pub t_steps: usize,
    pub stop_reason: StopReason,
    pub best_val_ci: f64,
    pub best_loss: f64,
    pub cvdata: Vec<CvEntry>,
    pub train_history: Vec<TrainEpochMetrics>,
    pub val_history: Vec<ValidationEpochMetrics>,
}

impl TrialReport {
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Result of [`run_trial`].
#[derive(Debug, Clone)]
pub struct TrialOutcome {
    pub best_ci: f64,
    pub best_loss: f64,
    pub report: TrialReport,
}

/// Train one configuration on `table` and report its best validation CI.
///
/// The table is split into train and validation rows, each normalised on
/// its own. Checkpoints go to `settings.checkpoint_dir` when set.
pub fn run_trial(
    config: &NetworkConfig,
    table: &SampleTable,
    settings: &TrainingSettings,
    device: &Device,
) -> Result<TrialOutcome> {
    config.validate()?;
    settings.validate()?;
    if table.width() != config.dat_size {
        return Err(CinetError::Config(format!(
            "feature width {} does not match dat_size {}",
            table.width(),
            config.dat_size
        )));
    }

    let split = train_val_split(table.len(), settings.val_ratio, settings.seed);
    let train_ds = PairedDataset::new(
        table,
        DatasetMode::Train,
        settings.delta,
        settings.batch_size,
        Some(&split.train_indices),
    )?;
    let val_ds = PairedDataset::new(
        table,
        DatasetMode::Train,
        settings.delta,
        settings.batch_size,
        Some(&split.val_indices),
    )?;
    let (train_samples, val_samples) = (train_ds.sample_count(), val_ds.sample_count());
    let (train_pairs, val_pairs) = (train_ds.len(), val_ds.len());
    if train_pairs == 0 || val_pairs == 0 {
        return Err(CinetError::Config(format!(
            "no usable pairs after splitting (train={train_pairs}, val={val_pairs}, delta={})",
            settings.delta
        )));
    }

    let loader_config = LoaderConfig::from_settings(settings);
    let train_loader = PairLoader::new(Arc::new(train_ds), loader_config.clone(), device)?;
    let val_loader = PairLoader::new(Arc::new(val_ds), loader_config.sequential(), device)?;

    let network = RankingNetwork::new(config, device)?;
    let parameter_count = network.parameter_count();
    let mut trainer = Trainer::new(network, train_loader, val_loader, settings)?;

    let state = match &settings.checkpoint_dir {
        Some(dir) => trainer.run(&mut Checkpointer::new(dir))?,
        None => trainer.run(&mut ())?,
    };

    let best = state
        .running
        .best()
        .ok_or_else(|| CinetError::Model("run finished without a validation epoch".to_string()))?;
    let stop_reason = match state.phase {
        Phase::Finished(reason) => reason,
        _ => StopReason::MaxEpochs,
    };

    let report = TrialReport {
        config: config.clone(),
        parameter_count,
        train_samples,
        val_samples,
        train_pairs,
        val_pairs,
        epochs: state.epoch,
        t_steps: state.t_steps,
        stop_reason,
        best_val_ci: best.ci,
        best_loss: best.loss,
        cvdata: state.running.cvdata().to_vec(),
        train_history: state.train_history,
        val_history: state.val_history,
    };
    Ok(TrialOutcome {
        best_ci: best.ci,
        best_loss: best.loss,
        report,
    })
}
