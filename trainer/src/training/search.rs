//! Random hyperparameter search over concurrent trials.
//!
//! Each trial trains an independent network on a blocking tokio task;
//! a semaphore bounds how many run at once. A failing trial is recorded
//! with its error and does not affect the others.

use super::data::SampleTable;
use super::trainer::run_trial;
use candle_core::Device;
use cinet_core::{CinetError, NetworkConfig, Result, TrainingSettings};
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Candidate values for each tuned option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSpace {
    pub hidden_one: Vec<usize>,
    pub hidden_two: Vec<usize>,
    pub hidden_three: Vec<usize>,
    pub hidden_four: Vec<usize>,
    /// Uniform range.
    pub dropout: (f64, f64),
    /// Log-uniform range.
    pub lr: (f64, f64),
    pub batchnorm: Vec<bool>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            hidden_one: vec![32, 128, 512],
            hidden_two: vec![32, 128, 512],
            hidden_three: vec![0, 32, 128, 512],
            hidden_four: vec![0, 32, 128, 512],
            dropout: (0.0, 0.4),
            lr: (1e-4, 1e-1),
            batchnorm: vec![true, false],
        }
    }
}

fn pick<T: Copy, R: Rng>(choices: &[T], fallback: T, rng: &mut R) -> T {
    choices.choose(rng).copied().unwrap_or(fallback)
}

impl SearchSpace {
    /// Draw one configuration. Options outside the space (input width,
    /// linear variant, penalty) come from `base`.
    pub fn sample<R: Rng>(&self, base: &NetworkConfig, rng: &mut R) -> NetworkConfig {
        let dropout = if self.dropout.0 < self.dropout.1 {
            rng.random_range(self.dropout.0..self.dropout.1)
        } else {
            self.dropout.0
        };
        let lr = if self.lr.0 < self.lr.1 {
            rng.random_range(self.lr.0.ln()..self.lr.1.ln()).exp()
        } else {
            self.lr.0
        };
        NetworkConfig {
            hidden_one: pick(&self.hidden_one, base.hidden_one, rng),
            hidden_two: pick(&self.hidden_two, base.hidden_two, rng),
            hidden_three: pick(&self.hidden_three, base.hidden_three, rng),
            hidden_four: pick(&self.hidden_four, base.hidden_four, rng),
            dropout,
            lr,
            batchnorm: pick(&self.batchnorm, base.batchnorm, rng),
            ..base.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = self.dropout;
        if !(0.0..1.0).contains(&lo) || !(0.0..1.0).contains(&hi) || lo > hi {
            return Err(CinetError::Config(format!(
                "dropout range must lie in [0, 1), got ({lo}, {hi})"
            )));
        }
        let (lo, hi) = self.lr;
        if !(lo > 0.0 && lo <= hi && hi.is_finite()) {
            return Err(CinetError::Config(format!(
                "lr range must be positive and ordered, got ({lo}, {hi})"
            )));
        }
        Ok(())
    }
}

/// Search driver options.
#[derive(Debug, Clone)]
pub struct TuneOptions {
    pub samples: usize,
    pub concurrency: usize,
    pub seed: u64,
}

/// Outcome of one trial; `error` is set when the trial failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial: usize,
    pub config: NetworkConfig,
    pub best_ci: Option<f64>,
    pub best_loss: Option<f64>,
    pub epochs: Option<usize>,
    pub error: Option<String>,
}

/// All trial results, best CI first. Failed trials sort last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneSummary {
    pub trials: Vec<TrialResult>,
}

impl TuneSummary {
    pub fn best(&self) -> Option<&TrialResult> {
        self.trials.first().filter(|t| t.best_ci.is_some())
    }

    pub fn failed(&self) -> usize {
        self.trials.iter().filter(|t| t.error.is_some()).count()
    }
}

/// Run `options.samples` trials drawn from `space`, at most
/// `options.concurrency` at a time.
pub async fn tune(
    table: Arc<SampleTable>,
    base: &NetworkConfig,
    settings: &TrainingSettings,
    space: &SearchSpace,
    options: &TuneOptions,
    device: &Device,
) -> Result<TuneSummary> {
    space.validate()?;
    if options.samples == 0 {
        return Err(CinetError::Config("samples must be non-zero".to_string()));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    let configs: Vec<NetworkConfig> = (0..options.samples)
        .map(|_| space.sample(base, &mut rng))
        .collect();

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut handles = Vec::with_capacity(configs.len());
    for (trial, config) in configs.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let table = Arc::clone(&table);
        let device = device.clone();
        let mut settings = settings.clone();
        settings.checkpoint_dir = settings
            .checkpoint_dir
            .as_deref()
            .map(|dir| trial_checkpoint_dir(dir, trial));

        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| CinetError::Model(format!("Trial semaphore closed: {e}")))?;
            tracing::info!(trial, ?config, "Starting trial");
            let trial_config = config.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                run_trial(&trial_config, &table, &settings, &device)
            })
            .await;
            let result = match outcome {
                Ok(Ok(outcome)) => TrialResult {
                    trial,
                    config,
                    best_ci: Some(outcome.best_ci),
                    best_loss: Some(outcome.best_loss),
                    epochs: Some(outcome.report.epochs),
                    error: None,
                },
                Ok(Err(e)) => failed(trial, config, e.to_string()),
                Err(e) => failed(trial, config, format!("trial task panicked: {e}")),
            };
            match &result.error {
                Some(error) => tracing::warn!(trial, %error, "Trial failed"),
                None => tracing::info!(trial, best_ci = ?result.best_ci, "Trial finished"),
            }
            Ok::<_, CinetError>(result)
        }));
    }

    let mut trials = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = handle
            .await
            .map_err(|e| CinetError::Model(format!("Trial task failed: {e}")))??;
        trials.push(result);
    }

    trials.sort_by(|a, b| {
        let key = |t: &TrialResult| t.best_ci.unwrap_or(f64::NEG_INFINITY);
        key(b).total_cmp(&key(a))
    });
    Ok(TuneSummary { trials })
}

/// Per-trial checkpoint directory under `dir`.
fn trial_checkpoint_dir(dir: &str, trial: usize) -> String {
    Path::new(dir)
        .join(format!("trial_{trial:03}"))
        .to_string_lossy()
        .into_owned()
}

fn failed(trial: usize, config: NetworkConfig, error: String) -> TrialResult {
    TrialResult {
        trial,
        config,
        best_ci: None,
        best_loss: None,
        epochs: None,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::trainer::BEST_CHECKPOINT;

    fn table() -> SampleTable {
        let ids = (0..15).map(|i| format!("cl{i}")).collect();
        let rows = (0..15)
            .map(|i| vec![(i as f32 * 0.3).sin(), ((i * 7) % 5) as f32, i as f32])
            .collect();
        let responses = (0..15).map(|i| ((i * 11) % 15) as f32).collect();
        SampleTable::new(ids, rows, responses).unwrap()
    }

    #[test]
    fn test_sample_stays_inside_space() {
        let space = SearchSpace::default();
        let base = NetworkConfig::with_input_width(42);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let config = space.sample(&base, &mut rng);
            assert!(space.hidden_one.contains(&config.hidden_one));
            assert!(space.hidden_three.contains(&config.hidden_three));
            assert!((0.0..0.4).contains(&config.dropout));
            assert!(config.lr >= 1e-4 && config.lr < 1e-1);
            assert_eq!(config.dat_size, 42);
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_sampling_is_seeded() {
        let space = SearchSpace::default();
        let base = NetworkConfig::with_input_width(3);
        let draw = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..5).map(|_| space.sample(&base, &mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(draw(1), draw(1));
    }

    #[test]
    fn test_invalid_space_rejected() {
        let space = SearchSpace {
            lr: (0.0, 1e-2),
            ..SearchSpace::default()
        };
        assert!(space.validate().is_err());
    }

    #[test]
    fn test_trial_checkpoint_dir_joins_path() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_string_lossy().into_owned();
        let joined = trial_checkpoint_dir(&base, 7);
        assert_eq!(Path::new(&joined), dir.path().join("trial_007"));
        assert_eq!(Path::new(&joined).parent(), Some(dir.path()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tune_writes_checkpoints_per_trial() {
        let dir = tempfile::tempdir().unwrap();
        let space = SearchSpace {
            hidden_one: vec![4],
            hidden_two: vec![0],
            hidden_three: vec![0],
            hidden_four: vec![0],
            batchnorm: vec![false],
            ..SearchSpace::default()
        };
        let settings = TrainingSettings {
            batch_size: 8,
            max_epochs: 1,
            patience: None,
            checkpoint_dir: Some(dir.path().to_string_lossy().into_owned()),
            ..TrainingSettings::default()
        };
        let options = TuneOptions {
            samples: 2,
            concurrency: 2,
            seed: 11,
        };
        let summary = tune(
            Arc::new(table()),
            &NetworkConfig::with_input_width(3),
            &settings,
            &space,
            &options,
            &Device::Cpu,
        )
        .await
        .unwrap();
        assert_eq!(summary.failed(), 0);
        for trial in 0..2 {
            let best = dir
                .path()
                .join(format!("trial_{trial:03}"))
                .join(BEST_CHECKPOINT);
            assert!(best.exists(), "missing {}", best.display());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tune_ranks_trials_and_isolates_failures() {
        let space = SearchSpace {
            hidden_one: vec![4],
            hidden_two: vec![0],
            hidden_three: vec![0],
            hidden_four: vec![0],
            batchnorm: vec![false],
            ..SearchSpace::default()
        };
        let settings = TrainingSettings {
            batch_size: 8,
            max_epochs: 2,
            patience: None,
            ..TrainingSettings::default()
        };
        let options = TuneOptions {
            samples: 3,
            concurrency: 2,
            seed: 5,
        };
        let table = Arc::new(table());

        let summary = tune(
            Arc::clone(&table),
            &NetworkConfig::with_input_width(3),
            &settings,
            &space,
            &options,
            &Device::Cpu,
        )
        .await
        .unwrap();
        assert_eq!(summary.trials.len(), 3);
        assert_eq!(summary.failed(), 0);
        let cis: Vec<f64> = summary.trials.iter().filter_map(|t| t.best_ci).collect();
        assert!(cis.windows(2).all(|w| w[0] >= w[1]));
        assert!(summary.best().is_some());

        // wrong input width: every trial fails, the driver still returns
        let summary = tune(
            table,
            &NetworkConfig::with_input_width(9),
            &settings,
            &space,
            &options,
            &Device::Cpu,
        )
        .await
        .unwrap();
        assert_eq!(summary.failed(), 3);
        assert!(summary.best().is_none());
    }
}
