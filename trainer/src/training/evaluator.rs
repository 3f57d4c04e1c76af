//! Single-sample scoring of held-out data.

use super::data::{DatasetMode, PairedDataset, SampleTable};
use super::loader::{LoaderConfig, SampleLoader};
use candle_core::Device;
use cinet_core::{CinetError, Prediction, Result, TrainingSettings};
use cinet_model::RankingNetwork;
use std::path::Path;
use std::sync::Arc;

/// Score every sample served by `loader`.
///
/// The score is the network's single-sample output; no pairing happens.
pub fn evaluate(network: &RankingNetwork, loader: &SampleLoader) -> Result<Vec<Prediction>> {
    let mut predictions = Vec::new();
    for batch in loader.batches() {
        let batch = batch?;
        let scores: Vec<f32> = network
            .score(&batch.genes)?
            .to_vec1()
            .map_err(|e| CinetError::Model(format!("Reading scores failed: {e}")))?;
        predictions.extend(
            batch
                .cell_lines
                .into_iter()
                .zip(batch.responses)
                .zip(scores)
                .map(|((sample_id, y_true), y_hat)| Prediction {
                    sample_id,
                    y_true,
                    y_hat,
                }),
        );
    }

    let non_finite = predictions.iter().filter(|p| !p.y_hat.is_finite()).count();
    if non_finite > 0 {
        tracing::warn!(non_finite, "Some test scores are not finite");
    }
    tracing::info!(samples = predictions.len(), "Test evaluation finished");
    Ok(predictions)
}

/// Normalise `table` on its own statistics and score every row.
pub fn evaluate_table(
    network: &RankingNetwork,
    table: &SampleTable,
    settings: &TrainingSettings,
    device: &Device,
) -> Result<Vec<Prediction>> {
    if table.width() != network.config().dat_size {
        return Err(CinetError::Config(format!(
            "feature width {} does not match dat_size {}",
            table.width(),
            network.config().dat_size
        )));
    }
    let dataset = PairedDataset::new(table, DatasetMode::Eval, settings.delta, settings.batch_size, None)?;
    let loader = SampleLoader::new(Arc::new(dataset), LoaderConfig::from_settings(settings), device)?;
    evaluate(network, &loader)
}

/// Write predictions as CSV with the header `cell_line,y_true,y_hat`.
pub fn write_predictions_csv(path: &Path, predictions: &[Prediction]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| CinetError::Data(format!("Failed to create {}: {e}", path.display())))?;
    for prediction in predictions {
        writer
            .serialize(prediction)
            .map_err(|e| CinetError::Data(format!("Failed to write prediction row: {e}")))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinet_core::NetworkConfig;

    fn table() -> SampleTable {
        let ids = (0..7).map(|i| format!("cl{i}")).collect();
        let rows = (0..7)
            .map(|i| vec![i as f32, ((i * 5) % 7) as f32, (i as f32).cos()])
            .collect();
        let responses = (0..7).map(|i| i as f32 * 0.25).collect();
        SampleTable::new(ids, rows, responses).unwrap()
    }

    fn network() -> RankingNetwork {
        let config = NetworkConfig {
            hidden_one: 4,
            ..NetworkConfig::with_input_width(3)
        };
        RankingNetwork::new(&config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_evaluate_table_scores_every_sample() {
        let settings = TrainingSettings {
            batch_size: 3,
            ..TrainingSettings::default()
        };
        let predictions = evaluate_table(&network(), &table(), &settings, &Device::Cpu).unwrap();
        assert_eq!(predictions.len(), 7);
        let ids: Vec<&str> = predictions.iter().map(|p| p.sample_id.as_str()).collect();
        assert_eq!(ids, vec!["cl0", "cl1", "cl2", "cl3", "cl4", "cl5", "cl6"]);
        assert!((predictions[4].y_true - 1.0).abs() < 1e-6);
        assert!(predictions.iter().all(|p| (0.0..=1.0).contains(&p.y_hat)));
    }

    #[test]
    fn test_evaluate_table_width_mismatch() {
        let config = NetworkConfig::with_input_width(4);
        let network = RankingNetwork::new(&config, &Device::Cpu).unwrap();
        let result = evaluate_table(&network, &table(), &TrainingSettings::default(), &Device::Cpu);
        assert!(matches!(result, Err(CinetError::Config(_))));
    }

    #[test]
    fn test_write_predictions_csv_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("predictions.csv");
        let predictions = vec![
            Prediction {
                sample_id: "A549".to_string(),
                y_true: 0.5,
                y_hat: 0.25,
            },
            Prediction {
                sample_id: "MCF7".to_string(),
                y_true: 1.5,
                y_hat: 0.75,
            },
        ];
        write_predictions_csv(&path, &predictions).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "cell_line,y_true,y_hat");
        assert_eq!(lines[1], "A549,0.5,0.25");
        assert_eq!(lines.len(), 3);
    }
}
