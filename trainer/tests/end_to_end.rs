//! End-to-end training, checkpointing and test scoring on small tables.

use candle_core::Device;
use cinet_core::{load_config, CinetError, NetworkConfig, TrainingSettings};
use cinet_model::RankingNetwork;
use cinet_trainer::training::data::{train_val_split, DatasetMode, PairedDataset, SampleTable};
use cinet_trainer::training::evaluator::{evaluate_table, write_predictions_csv};
use cinet_trainer::training::loader::{LoaderConfig, PairLoader};
use cinet_trainer::training::metrics::{TrainEpochMetrics, ValidationEpochMetrics};
use cinet_trainer::training::trainer::{
    run_trial, EpochObserver, Phase, StopReason, Trainer, BEST_CHECKPOINT,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

fn table(n: usize, width: usize) -> SampleTable {
    let ids = (0..n).map(|i| format!("CL-{i:02}")).collect();
    let rows = (0..n)
        .map(|i| {
            (0..width)
                .map(|j| ((i + 1) as f32 * (j + 2) as f32 * 0.37).sin() * (j + 1) as f32)
                .collect()
        })
        .collect();
    // pairwise distinct for every n used here
    let responses = (0..n).map(|i| (i as f32 * 0.77).sin() * 2.0).collect();
    SampleTable::new(ids, rows, responses).unwrap()
}

fn network_config() -> NetworkConfig {
    NetworkConfig {
        hidden_one: 8,
        hidden_two: 4,
        hidden_three: 0,
        hidden_four: 0,
        dropout: 0.1,
        lr: 1e-3,
        batchnorm: true,
        ..NetworkConfig::with_input_width(5)
    }
}

fn settings(epochs: usize) -> TrainingSettings {
    TrainingSettings {
        delta: 0.0,
        max_epochs: epochs,
        patience: None,
        ..TrainingSettings::default()
    }
}

#[derive(Default)]
struct Recorder {
    train: Vec<TrainEpochMetrics>,
    val: Vec<ValidationEpochMetrics>,
}

impl EpochObserver for Recorder {
    fn on_train_epoch(&mut self, metrics: &TrainEpochMetrics) -> cinet_core::Result<()> {
        self.train.push(metrics.clone());
        Ok(())
    }

    fn on_validation_epoch(
        &mut self,
        _network: &RankingNetwork,
        metrics: &ValidationEpochMetrics,
    ) -> cinet_core::Result<()> {
        self.val.push(metrics.clone());
        Ok(())
    }
}

#[test]
fn test_ten_samples_five_epochs() {
    let outcome = run_trial(&network_config(), &table(10, 5), &settings(5), &Device::Cpu).unwrap();
    let report = &outcome.report;

    assert_eq!(report.train_history.len(), 5);
    assert_eq!(report.val_history.len(), 5);
    assert_eq!(report.train_samples, 8);
    assert_eq!(report.val_samples, 2);
    assert!((0.0..=1.0).contains(&outcome.best_ci));
    assert!(outcome.best_loss.is_finite());
    for (i, val) in report.val_history.iter().enumerate() {
        assert_eq!(val.epoch, i + 1);
        assert!((0.0..=1.0).contains(&val.val_ci));
        assert!(val.best_val_ci >= val.val_ci);
    }
    let last = report.val_history.last().unwrap();
    assert!((last.best_val_ci - outcome.best_ci).abs() < 1e-12);
}

#[test]
fn test_observer_sees_every_epoch() {
    let table = table(12, 5);
    let settings = settings(4);
    let split = train_val_split(table.len(), settings.val_ratio, settings.seed);
    let device = Device::Cpu;

    let train = PairedDataset::new(&table, DatasetMode::Train, 0.0, 8, Some(&split.train_indices))
        .unwrap();
    let val =
        PairedDataset::new(&table, DatasetMode::Train, 0.0, 8, Some(&split.val_indices)).unwrap();
    let loader_config = LoaderConfig {
        batch_size: 8,
        shuffle: true,
        seed: 3,
        num_workers: 2,
        prefetch: 2,
    };
    let train_loader = PairLoader::new(Arc::new(train), loader_config.clone(), &device).unwrap();
    let val_loader = PairLoader::new(Arc::new(val), loader_config.sequential(), &device).unwrap();

    let network = RankingNetwork::new(&network_config(), &device).unwrap();
    let mut trainer = Trainer::new(network, train_loader, val_loader, &settings).unwrap();
    let mut recorder = Recorder::default();
    let state = trainer.run(&mut recorder).unwrap();

    assert_eq!(state.phase, Phase::Finished(StopReason::MaxEpochs));
    assert_eq!(recorder.train.len(), 4);
    assert_eq!(recorder.val.len(), 4);
    assert_eq!(state.running.cvdata().len(), 4);
    // 9 training samples give 36 pairs, 5 batches of 8 per epoch
    assert_eq!(state.t_steps, 4 * 5);
    assert_eq!(recorder.train[3].t_steps, state.t_steps);
}

#[test]
fn test_early_stopping_ends_run() {
    // lr far below f32 resolution leaves the weights fixed, so validation
    // CI never improves after the first epoch
    let config = NetworkConfig {
        lr: 1e-12,
        dropout: 0.0,
        batchnorm: false,
        ..network_config()
    };
    let mut s = settings(50);
    s.patience = Some(1);
    s.min_epochs = 1;
    let outcome = run_trial(&config, &table(10, 5), &s, &Device::Cpu).unwrap();
    let report = &outcome.report;

    assert_eq!(report.stop_reason, StopReason::EarlyStopping);
    assert_eq!(report.epochs, 2);
    assert_eq!(report.val_history.len(), 2);
    assert_eq!(report.val_history[0].val_ci, report.val_history[1].val_ci);
}

#[test]
fn test_all_tied_responses_fail_before_training() {
    let ids = (0..10).map(|i| format!("CL-{i}")).collect();
    let rows = (0..10)
        .map(|i| {
            let x = i as f32;
            vec![x, 1.0 - x * 0.1, (x * 0.5).cos(), x * x, 3.0 + x.sin()]
        })
        .collect();
    let table = SampleTable::new(ids, rows, vec![0.25; 10]).unwrap();
    let result = run_trial(&network_config(), &table, &settings(5), &Device::Cpu);
    assert!(matches!(result, Err(CinetError::Config(_))));
}

fn write_csv(path: &Path, table: &SampleTable) {
    let mut f = std::fs::File::create(path).unwrap();
    let features: Vec<String> = (0..table.width()).map(|j| format!("gene_{j}")).collect();
    writeln!(f, "cell_line,target,{}", features.join(",")).unwrap();
    for i in 0..table.len() {
        let row: Vec<String> = table.row(i).iter().map(|v| v.to_string()).collect();
        writeln!(f, "{},{},{}", table.ids()[i], table.responses()[i], row.join(",")).unwrap();
    }
}

#[test]
fn test_csv_train_checkpoint_and_score() {
    let dir = tempfile::tempdir().unwrap();
    let source = table(14, 5);
    let data_path = dir.path().join("train.csv");
    write_csv(&data_path, &source);

    let config_path = dir.path().join("experiment.yaml");
    std::fs::write(
        &config_path,
        format!(
            r#"
network:
  hidden_one: 8
  hidden_two: 4
  dropout: 0.1
  lr: 0.001
  batchnorm: true
  dat_size: 5
training:
  max_epochs: 3
  patience: null
  batch_size: 16
  checkpoint_dir: "{}"
"#,
            dir.path().join("ckpt").display()
        ),
    )
    .unwrap();

    let config = load_config(&config_path).unwrap();
    let loaded = SampleTable::from_csv(&data_path, &config.training.response_column).unwrap();
    assert_eq!(loaded.len(), 14);
    assert_eq!(loaded.width(), 5);

    let outcome = run_trial(&config.network, &loaded, &config.training, &Device::Cpu).unwrap();
    assert_eq!(outcome.report.val_history.len(), 3);

    let checkpoint = dir.path().join("ckpt").join(BEST_CHECKPOINT);
    let network = RankingNetwork::load(&config.network, &checkpoint, &Device::Cpu).unwrap();
    let predictions = evaluate_table(&network, &loaded, &config.training, &Device::Cpu).unwrap();
    assert_eq!(predictions.len(), 14);
    assert_eq!(predictions[0].sample_id, "CL-00");

    let out = dir.path().join("predictions.csv");
    write_predictions_csv(&out, &predictions).unwrap();
    let written = std::fs::read_to_string(&out).unwrap();
    assert!(written.starts_with("cell_line,y_true,y_hat\n"));
    assert_eq!(written.lines().count(), 15);
}
