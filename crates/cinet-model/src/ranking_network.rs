//! Siamese ranking network (DeepCINET).
//!
//! A single embedding function maps a gene-expression vector to one scalar.
//! Both members of a pair go through the same weights and the ranking signal
//! is the difference of the two scalars.
//!
//! # Architecture
//!
//! ```text
//! deep:    x → [Linear → LeakyReLU → (BatchNorm) → (Dropout)] × hidden → Linear(1) → Sigmoid
//! linear:  x → Linear(1)
//! pair:    embed(a) − embed(b)
//! ```
//!
//! The first hidden block never carries batch normalisation or dropout.
//! The linear variant is trained with an elastic-net penalty over all of its
//! parameters, see [`RankingNetwork::regularization_penalty`].

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{
    BatchNorm, BatchNormConfig, Dropout, Linear, Module, ModuleT, VarBuilder, VarMap,
};
use cinet_core::{CinetError, NetworkConfig, Result};
use std::path::Path;

/// Negative slope of the hidden-layer activation.
const LEAKY_RELU_SLOPE: f64 = 0.01;

/// Name fragment shared by batch-norm running statistics.
const RUNNING_STAT_MARKER: &str = "running_";

fn leaky_relu(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.maximum(&xs.affine(LEAKY_RELU_SLOPE, 0.0)?)
}

struct HiddenBlock {
    linear: Linear,
    batch_norm: Option<BatchNorm>,
    dropout: Option<Dropout>,
}

impl HiddenBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.linear.forward(xs)?;
        let xs = leaky_relu(&xs)?;
        let xs = match &self.batch_norm {
            Some(bn) => bn.forward_t(&xs, train)?,
            None => xs,
        };
        match &self.dropout {
            Some(dropout) => dropout.forward_t(&xs, train),
            None => Ok(xs),
        }
    }
}

/// Deep embedding: hidden blocks followed by a sigmoid output unit.
struct FullyConnected {
    hidden: Vec<HiddenBlock>,
    output: Linear,
}

impl FullyConnected {
    fn new(config: &NetworkConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let sizes = config.layer_sizes();
        let last = sizes.len() - 1;
        let mut hidden = Vec::with_capacity(last.saturating_sub(1));

        for i in 0..last.saturating_sub(1) {
            let block_vb = vb.pp(i.to_string());
            let linear = candle_nn::linear(sizes[i], sizes[i + 1], block_vb.pp("linear"))?;
            let first = i == 0;
            let batch_norm = if config.batchnorm && !first {
                Some(candle_nn::batch_norm(
                    sizes[i + 1],
                    BatchNormConfig::default(),
                    block_vb.pp("bn"),
                )?)
            } else {
                None
            };
            let dropout = (!first && config.dropout > 0.0).then(|| Dropout::new(config.dropout as f32));
            hidden.push(HiddenBlock {
                linear,
                batch_norm,
                dropout,
            });
        }

        let output = candle_nn::linear(sizes[last - 1], sizes[last], vb.pp(last - 1).pp("linear"))?;
        Ok(Self { hidden, output })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for block in &self.hidden {
            xs = block.forward_t(&xs, train)?;
        }
        let xs = self.output.forward(&xs)?;
        candle_nn::ops::sigmoid(&xs)
    }
}

enum Embedding {
    Deep(FullyConnected),
    Linear(Linear),
}

/// Siamese ranking network owning its parameter set.
pub struct RankingNetwork {
    embedding: Embedding,
    varmap: VarMap,
    config: NetworkConfig,
    device: Device,
}

impl RankingNetwork {
    /// Create a network with freshly initialised weights.
    ///
    /// The configuration is validated first; an invalid configuration never
    /// allocates parameters.
    pub fn new(config: &NetworkConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embedding = if config.linear {
            let linear = candle_nn::linear(config.dat_size, 1, vb.pp("fc").pp(0).pp("linear"))
                .map_err(|e| CinetError::Model(format!("Failed to create linear scorer: {e}")))?;
            Embedding::Linear(linear)
        } else {
            let fc = FullyConnected::new(config, vb.pp("fc"))
                .map_err(|e| CinetError::Model(format!("Failed to create hidden layers: {e}")))?;
            Embedding::Deep(fc)
        };

        let network = Self {
            embedding,
            varmap,
            config: config.clone(),
            device: device.clone(),
        };

        tracing::info!(
            layers = ?config.layer_sizes(),
            linear = config.linear,
            batchnorm = config.batchnorm,
            parameters = network.parameter_count(),
            "Ranking network initialised"
        );
        Ok(network)
    }

    /// Rebuild a network from `config` and load its weights from a
    /// safetensors file written by [`RankingNetwork::save`].
    pub fn load(config: &NetworkConfig, path: &Path, device: &Device) -> Result<Self> {
        let mut network = Self::new(config, device)?;
        network.varmap.load(path).map_err(|e| {
            CinetError::Model(format!(
                "Failed to load weights from {}: {e}",
                path.display()
            ))
        })?;
        Ok(network)
    }

    /// Write the current parameters, including batch-norm statistics.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.varmap.save(path).map_err(|e| {
            CinetError::Model(format!("Failed to save weights to {}: {e}", path.display()))
        })
    }

    /// Embed a `[batch, dat_size]` feature batch into `[batch, 1]` scores.
    ///
    /// `train` enables dropout and batch statistics.
    pub fn embed(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_, width) = xs
            .dims2()
            .map_err(|e| CinetError::Model(format!("Expected a 2-d feature batch: {e}")))?;
        if width != self.config.dat_size {
            return Err(CinetError::Config(format!(
                "feature width {width} does not match dat_size {}",
                self.config.dat_size
            )));
        }

        let out = match &self.embedding {
            Embedding::Deep(fc) => fc.forward_t(xs, train),
            Embedding::Linear(linear) => linear.forward(xs),
        };
        out.map_err(|e| CinetError::Model(format!("Embedding forward failed: {e}")))
    }

    /// Pair forward: `embed(a) - embed(b)` flattened to `[batch]`.
    ///
    /// Both inputs run through the same parameters, so gradients from the
    /// two invocations accumulate on one weight set.
    pub fn forward_pair(&self, gene_a: &Tensor, gene_b: &Tensor, train: bool) -> Result<Tensor> {
        if gene_a.dims() != gene_b.dims() {
            return Err(CinetError::Config(format!(
                "pair inputs differ in shape: {:?} vs {:?}",
                gene_a.dims(),
                gene_b.dims()
            )));
        }
        let t_a = self.embed(gene_a, train)?;
        let t_b = self.embed(gene_b, train)?;
        t_a.sub(&t_b)
            .and_then(|z| z.flatten_all())
            .map_err(|e| CinetError::Model(format!("Pair difference failed: {e}")))
    }

    /// Single-sample scores in evaluation mode, flattened to `[batch]`.
    pub fn score(&self, xs: &Tensor) -> Result<Tensor> {
        self.embed(xs, false)?
            .flatten_all()
            .map_err(|e| CinetError::Model(format!("Score flatten failed: {e}")))
    }

    /// Weighted elastic-net penalty `reg_contr * (ratio·‖w‖₁ + (1−ratio)·‖w‖₂²)`
    /// over every trainable parameter.
    ///
    /// Returns `None` when the configuration carries no penalty.
    pub fn regularization_penalty(&self) -> Result<Option<Tensor>> {
        let Some((ratio, reg_contr)) = self.config.elastic_net() else {
            return Ok(None);
        };

        let map_err = |e: candle_core::Error| {
            CinetError::Model(format!("Elastic-net penalty failed: {e}"))
        };
        let mut l1 = Tensor::zeros((), DType::F32, &self.device).map_err(map_err)?;
        let mut l2 = Tensor::zeros((), DType::F32, &self.device).map_err(map_err)?;
        for var in self.trainable_vars()? {
            let w = var.as_tensor();
            l1 = l1.add(&w.abs().and_then(|t| t.sum_all()).map_err(map_err)?).map_err(map_err)?;
            l2 = l2.add(&w.sqr().and_then(|t| t.sum_all()).map_err(map_err)?).map_err(map_err)?;
        }
        let penalty = l1
            .affine(ratio, 0.0)
            .and_then(|l1| l1.add(&l2.affine(1.0 - ratio, 0.0)?))
            .and_then(|p| p.affine(reg_contr, 0.0))
            .map_err(map_err)?;
        Ok(Some(penalty))
    }

    /// Parameters updated by the optimizer (batch-norm running statistics
    /// are excluded).
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| CinetError::Model("parameter map lock poisoned".to_string()))?;
        let mut named: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| !name.contains(RUNNING_STAT_MARKER))
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
    }

    /// Number of trainable scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.trainable_vars()
            .map(|vars| vars.iter().map(|v| v.elem_count()).sum())
            .unwrap_or(0)
    }

    /// Full parameter store, for snapshotting.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Returns a reference to the device this network runs on.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn deep_config() -> NetworkConfig {
        NetworkConfig {
            hidden_one: 8,
            hidden_two: 4,
            dropout: 0.1,
            batchnorm: true,
            ..NetworkConfig::with_input_width(5)
        }
    }

    fn linear_config() -> NetworkConfig {
        NetworkConfig {
            linear: true,
            ratio: Some(0.5),
            reg_contr: Some(0.1),
            ..NetworkConfig::with_input_width(5)
        }
    }

    fn batch(rows: usize, offset: f32) -> Tensor {
        let data: Vec<f32> = (0..rows * 5)
            .map(|i| ((i as f32) * 0.37 + offset).sin())
            .collect();
        Tensor::from_vec(data, (rows, 5), &Device::Cpu).unwrap()
    }

    fn var_names(network: &RankingNetwork) -> Vec<String> {
        let data = network.varmap().data().lock().unwrap();
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        names
    }

    #[test]
    fn test_deep_network_parameter_count() {
        let network = RankingNetwork::new(&deep_config(), &Device::Cpu).unwrap();
        // 5→8, 8→4 (+ bn gamma/beta), 4→1
        let expected = (5 * 8 + 8) + (8 * 4 + 4) + (4 + 4) + (4 + 1);
        assert_eq!(network.parameter_count(), expected);
    }

    #[test]
    fn test_first_block_has_no_batch_norm() {
        let network = RankingNetwork::new(&deep_config(), &Device::Cpu).unwrap();
        let names = var_names(&network);
        assert!(!names.iter().any(|n| n.starts_with("fc.0.bn")));
        assert!(names.iter().any(|n| n.starts_with("fc.1.bn")));
        assert!(names.iter().any(|n| n.starts_with("fc.2.linear")));
    }

    #[test]
    fn test_no_hidden_layers_builds_output_only() {
        let config = NetworkConfig::with_input_width(5);
        let network = RankingNetwork::new(&config, &Device::Cpu).unwrap();
        assert_eq!(network.parameter_count(), 6);
        let scores = network.score(&batch(3, 0.0)).unwrap();
        assert_eq!(scores.dims(), &[3]);
    }

    #[test]
    fn test_forward_pair_is_antisymmetric_in_eval() {
        let network = RankingNetwork::new(&deep_config(), &Device::Cpu).unwrap();
        let a = batch(4, 0.0);
        let b = batch(4, 1.5);

        let ab: Vec<f32> = network.forward_pair(&a, &b, false).unwrap().to_vec1().unwrap();
        let ba: Vec<f32> = network.forward_pair(&b, &a, false).unwrap().to_vec1().unwrap();
        assert_eq!(ab.len(), 4);
        for (x, y) in ab.iter().zip(ba.iter()) {
            assert!((x + y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_forward_pair_same_input_is_zero() {
        let network = RankingNetwork::new(&deep_config(), &Device::Cpu).unwrap();
        let a = batch(3, 0.2);
        let z: Vec<f32> = network.forward_pair(&a, &a, false).unwrap().to_vec1().unwrap();
        assert!(z.iter().all(|v| v.abs() < 1e-7));
    }

    #[test]
    fn test_training_forward_runs_with_batch_norm() {
        let network = RankingNetwork::new(&deep_config(), &Device::Cpu).unwrap();
        let z = network.forward_pair(&batch(4, 0.0), &batch(4, 0.9), true).unwrap();
        assert_eq!(z.dims(), &[4]);
    }

    #[test]
    fn test_deep_scores_lie_in_unit_interval() {
        let network = RankingNetwork::new(&deep_config(), &Device::Cpu).unwrap();
        let scores: Vec<f32> = network.score(&batch(6, 0.3)).unwrap().to_vec1().unwrap();
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn test_width_mismatch_is_config_error() {
        let network = RankingNetwork::new(&deep_config(), &Device::Cpu).unwrap();
        let wrong = Tensor::zeros((2, 7), DType::F32, &Device::Cpu).unwrap();
        let result = network.score(&wrong);
        assert!(matches!(result, Err(CinetError::Config(_))));
    }

    #[test]
    fn test_pair_shape_mismatch_is_config_error() {
        let network = RankingNetwork::new(&deep_config(), &Device::Cpu).unwrap();
        let result = network.forward_pair(&batch(2, 0.0), &batch(3, 0.0), false);
        assert!(matches!(result, Err(CinetError::Config(_))));
    }

    #[test]
    fn test_penalty_only_for_linear_variant() {
        let deep = RankingNetwork::new(&deep_config(), &Device::Cpu).unwrap();
        assert!(deep.regularization_penalty().unwrap().is_none());

        let linear = RankingNetwork::new(&linear_config(), &Device::Cpu).unwrap();
        assert_eq!(linear.parameter_count(), 6);
        let penalty = linear.regularization_penalty().unwrap().unwrap();
        let value = penalty.to_scalar::<f32>().unwrap();

        let mut l1 = 0.0f32;
        let mut l2 = 0.0f32;
        for var in linear.trainable_vars().unwrap() {
            let w: Vec<f32> = var.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
            l1 += w.iter().map(|x| x.abs()).sum::<f32>();
            l2 += w.iter().map(|x| x * x).sum::<f32>();
        }
        let expected = 0.1 * (0.5 * l1 + 0.5 * l2);
        assert!((value - expected).abs() < 1e-5);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = deep_config();
        config.dropout = 1.0;
        assert!(RankingNetwork::new(&config, &Device::Cpu).is_err());
    }

    #[test]
    fn test_save_then_load_reproduces_scores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("best.safetensors");
        let network = RankingNetwork::new(&deep_config(), &Device::Cpu).unwrap();
        network.save(&path).unwrap();

        let restored = RankingNetwork::load(&deep_config(), &path, &Device::Cpu).unwrap();
        let x = batch(5, 0.7);
        let before: Vec<f32> = network.score(&x).unwrap().to_vec1().unwrap();
        let after: Vec<f32> = restored.score(&x).unwrap().to_vec1().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_load_nonexistent_path_fails() {
        let result = RankingNetwork::load(
            &deep_config(),
            Path::new("/nonexistent/best.safetensors"),
            &Device::Cpu,
        );
        assert!(result.is_err());
    }
}
