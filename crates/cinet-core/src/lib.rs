//! Core types for DeepCINET pairwise drug-response ranking.
//!
//! This crate holds everything the model and trainer crates share without
//! pulling in a tensor back-end:
//!
//! - the pair and prediction records produced by the pipeline,
//! - typed configuration records with fail-fast validation,
//! - the error taxonomy and a crate-wide [`Result`] alias.
//!
//! # Example
//!
//! ```
//! use cinet_core::{NetworkConfig, Pair};
//!
//! let pair = Pair::from_responses(0, 1, &[1.0, 5.0]);
//! assert_eq!(pair.label, 0);
//!
//! let config = NetworkConfig {
//!     hidden_one: 8,
//!     hidden_two: 4,
//!     ..NetworkConfig::with_input_width(5)
//! };
//! assert_eq!(config.layer_sizes(), vec![5, 8, 4, 1]);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod config;

pub use config::load_config;

// ---------------------------------------------------------------------------
// Data records
// ---------------------------------------------------------------------------

/// A comparison between two samples of the same dataset.
///
/// `label` is 1 when the response of `idx_a` is strictly greater than the
/// response of `idx_b`, otherwise 0. It is always derived from the two raw
/// responses through [`Pair::from_responses`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    /// Row index of the first sample.
    pub idx_a: usize,
    /// Row index of the second sample.
    pub idx_b: usize,
    /// Ranking label: 1 if `response[idx_a] > response[idx_b]`.
    pub label: u8,
}

impl Pair {
    /// Build a pair and derive its label from the raw responses.
    ///
    /// # Panics
    ///
    /// Panics if either index is out of bounds for `responses`.
    pub fn from_responses(idx_a: usize, idx_b: usize, responses: &[f32]) -> Self {
        Self {
            idx_a,
            idx_b,
            label: u8::from(responses[idx_a] > responses[idx_b]),
        }
    }

    /// Label as the float target consumed by the loss.
    pub fn target(&self) -> f32 {
        f32::from(self.label)
    }
}

/// One row of the test-time prediction table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Sample identifier (the row key of the input table).
    #[serde(rename = "cell_line")]
    pub sample_id: String,
    /// Observed response.
    pub y_true: f32,
    /// Score produced by the ranking network for this single sample.
    pub y_hat: f32,
}

/// Pipeline stage in which a numeric failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Training,
    Validation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Training => write!(f, "training"),
            Stage::Validation => write!(f, "validation"),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Architecture and optimizer options for one trial.
///
/// Hidden widths of 0 disable the corresponding layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub hidden_one: usize,
    #[serde(default)]
    pub hidden_two: usize,
    #[serde(default)]
    pub hidden_three: usize,
    #[serde(default)]
    pub hidden_four: usize,
    /// Dropout rate for every hidden block after the first.
    #[serde(default)]
    pub dropout: f64,
    /// Adam learning rate.
    pub lr: f64,
    /// Insert batch normalisation after the activation of hidden blocks.
    #[serde(default)]
    pub batchnorm: bool,
    /// Input feature width. Must match the loaded feature matrix.
    pub dat_size: usize,
    /// Use the single linear layer variant with an elastic-net penalty.
    #[serde(default)]
    pub linear: bool,
    /// L1 share of the elastic-net penalty (L2 share is `1 - ratio`).
    #[serde(default)]
    pub ratio: Option<f64>,
    /// Overall weight of the elastic-net penalty.
    #[serde(default)]
    pub reg_contr: Option<f64>,
}

impl NetworkConfig {
    /// A configuration with no hidden layers for the given input width.
    pub fn with_input_width(dat_size: usize) -> Self {
        Self {
            hidden_one: 0,
            hidden_two: 0,
            hidden_three: 0,
            hidden_four: 0,
            dropout: 0.0,
            lr: 1e-3,
            batchnorm: false,
            dat_size,
            linear: false,
            ratio: None,
            reg_contr: None,
        }
    }

    /// Layer widths from input to the single output, zero widths removed.
    pub fn layer_sizes(&self) -> Vec<usize> {
        [
            self.dat_size,
            self.hidden_one,
            self.hidden_two,
            self.hidden_three,
            self.hidden_four,
            1,
        ]
        .into_iter()
        .filter(|&width| width != 0)
        .collect()
    }

    /// Elastic-net `(ratio, reg_contr)` for the linear variant.
    ///
    /// Returns `None` for the deep variant.
    pub fn elastic_net(&self) -> Option<(f64, f64)> {
        if !self.linear {
            return None;
        }
        Some((self.ratio?, self.reg_contr?))
    }

    /// Reject option combinations that cannot produce a valid network.
    pub fn validate(&self) -> Result<()> {
        if self.dat_size == 0 {
            return Err(CinetError::Config("dat_size must be non-zero".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(CinetError::Config(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(CinetError::Config(format!(
                "lr must be a positive finite number, got {}",
                self.lr
            )));
        }
        if self.linear {
            match (self.ratio, self.reg_contr) {
                (Some(ratio), Some(reg_contr)) => {
                    if !(0.0..=1.0).contains(&ratio) {
                        return Err(CinetError::Config(format!(
                            "ratio must lie in [0, 1], got {ratio}"
                        )));
                    }
                    if !(reg_contr.is_finite() && reg_contr >= 0.0) {
                        return Err(CinetError::Config(format!(
                            "reg_contr must be non-negative, got {reg_contr}"
                        )));
                    }
                }
                _ => {
                    return Err(CinetError::Config(
                        "linear variant requires both ratio and reg_contr".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Loop, data and loader settings for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// Mini-batch size for pairs and samples.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Minimum absolute response difference for a pair to be kept.
    #[serde(default)]
    pub delta: f32,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    /// Early stopping is not evaluated before this many epochs.
    #[serde(default = "default_min_epochs")]
    pub min_epochs: usize,
    /// Optional budget of optimizer steps across the whole run.
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// Validation epochs without CI improvement before stopping.
    /// `None` disables early stopping.
    #[serde(default = "default_patience")]
    pub patience: Option<usize>,
    /// Share of samples held out for validation.
    #[serde(default = "default_val_ratio")]
    pub val_ratio: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Batch assembly threads. 0 assembles on the compute thread.
    #[serde(default)]
    pub num_workers: usize,
    /// Capacity of the prefetch queue between workers and compute thread.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    /// Name of the response column in the input table.
    #[serde(default = "default_response_column")]
    pub response_column: String,
    /// Epochs at which the learning rate is multiplied by `sc_gamma`.
    #[serde(default)]
    pub sc_milestones: Vec<usize>,
    #[serde(default = "default_sc_gamma")]
    pub sc_gamma: f64,
    /// Directory for parameter snapshots at improvement points.
    #[serde(default)]
    pub checkpoint_dir: Option<String>,
}

fn default_batch_size() -> usize {
    256
}

fn default_max_epochs() -> usize {
    100
}

fn default_min_epochs() -> usize {
    1
}

fn default_patience() -> Option<usize> {
    Some(10)
}

fn default_val_ratio() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

fn default_prefetch() -> usize {
    2
}

fn default_shuffle() -> bool {
    true
}

fn default_response_column() -> String {
    "target".to_string()
}

fn default_sc_gamma() -> f64 {
    0.1
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            delta: 0.0,
            max_epochs: default_max_epochs(),
            min_epochs: default_min_epochs(),
            max_steps: None,
            patience: default_patience(),
            val_ratio: default_val_ratio(),
            seed: default_seed(),
            num_workers: 0,
            prefetch: default_prefetch(),
            shuffle: default_shuffle(),
            response_column: default_response_column(),
            sc_milestones: Vec::new(),
            sc_gamma: default_sc_gamma(),
            checkpoint_dir: None,
        }
    }
}

impl TrainingSettings {
    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CinetError::Config("batch_size must be non-zero".to_string()));
        }
        if !(self.val_ratio > 0.0 && self.val_ratio < 1.0) {
            return Err(CinetError::Config(format!(
                "val_ratio must lie in (0, 1), got {}",
                self.val_ratio
            )));
        }
        if !(self.delta.is_finite() && self.delta >= 0.0) {
            return Err(CinetError::Config(format!(
                "delta must be non-negative, got {}",
                self.delta
            )));
        }
        if self.prefetch == 0 {
            return Err(CinetError::Config("prefetch must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Top-level experiment configuration as read from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        self.training.validate()
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum CinetError {
    /// Invalid configuration or dataset shape, raised before training starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed tabular input.
    #[error("Data error: {0}")]
    Data(String),

    /// Loss became NaN or infinite.
    #[error("Numeric instability during {stage} (epoch {epoch}, step {step}): loss = {value}")]
    NumericInstability {
        /// Stage that produced the non-finite value.
        stage: Stage,
        /// One-based epoch number.
        epoch: usize,
        /// Cumulative optimizer step count at the failure.
        step: usize,
        /// The offending loss value.
        value: f64,
    },

    /// Tensor back-end failure.
    #[error("Model error: {0}")]
    Model(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `std::result::Result<T, CinetError>`.
pub type Result<T> = std::result::Result<T, CinetError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
