//! DeepCINET training and evaluation.
//!
//! Trains a Siamese ranking network on concordant sample pairs and tracks
//! validation concordance index across epochs.
//!
//! # Modules
//!
//! - [`training::pairs`]: concordant pair index construction
//! - [`training::data`]: sample tables, normalisation and the paired dataset
//! - [`training::loader`]: mini-batch loaders with a worker prefetch queue
//! - [`training::metrics`]: concordance index and best-score tracking
//! - [`training::trainer`]: the train/validate loop and [`run_trial`]
//! - [`training::evaluator`]: single-sample test scoring
//! - [`training::search`]: random hyperparameter search

pub mod training;

pub use training::trainer::{run_trial, TrialOutcome, TrialReport};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::training::data::{DatasetMode, PairedDataset, SampleTable};
    pub use crate::training::evaluator::{evaluate, evaluate_table, write_predictions_csv};
    pub use crate::training::metrics::{concordance_index, RunningMetrics};
    pub use crate::training::pairs::build_concordant_pairs;
    pub use crate::training::search::{tune, SearchSpace, TuneOptions, TuneSummary};
    pub use crate::training::trainer::{run_trial, TrialOutcome, TrialReport};
}
