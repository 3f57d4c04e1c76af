//! DeepCINET training pipeline.
//!
//! Pairs are built from the sample table, served in mini-batches to a
//! Siamese ranking network and scored by concordance index.

pub mod data;
pub mod evaluator;
pub mod loader;
pub mod metrics;
pub mod pairs;
pub mod search;
pub mod trainer;
