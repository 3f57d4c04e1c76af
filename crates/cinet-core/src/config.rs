//! YAML configuration loading for training runs.
//!
//! Loads an [`ExperimentConfig`] from a YAML file on disk and validates it
//! before anything else is allocated.

use crate::{CinetError, ExperimentConfig, Result};
use std::path::Path;

/// Load and validate an [`ExperimentConfig`] from the YAML file at `path`.
///
/// # Errors
///
/// Returns [`CinetError::Config`] if the file cannot be read, the YAML is
/// invalid, or the decoded options fail validation.
pub fn load_config(path: &Path) -> Result<ExperimentConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        CinetError::Config(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    let config: ExperimentConfig = serde_yaml::from_str(&contents)
        .map_err(|e| CinetError::Config(format!("Failed to parse config YAML: {e}")))?;
    config.validate()?;
    Ok(config)
}
