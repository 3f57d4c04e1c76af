//! Mini-batch loaders with an optional worker prefetch queue.
//!
//! Each epoch gets a batch plan: item indices, shuffled with a seed derived
//! from the base seed and the epoch number, cut into `batch_size` chunks.
//! With `num_workers == 0` the plan is assembled on the calling thread.
//! Otherwise worker threads pull chunks from a job channel, copy features
//! into host buffers and push them through a bounded channel of capacity
//! `prefetch`. Tensors are created on the consuming thread. Batch arrival
//! order across workers is not guaranteed.

use super::data::{DatasetItem, DatasetMode, PairedDataset};
use candle_core::{Device, Tensor};
use cinet_core::{CinetError, Result, TrainingSettings};
use crossbeam_channel::{bounded, unbounded, Receiver};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Batching and prefetch options.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub num_workers: usize,
    pub prefetch: usize,
}

impl LoaderConfig {
    pub fn from_settings(settings: &TrainingSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            shuffle: settings.shuffle,
            seed: settings.seed,
            num_workers: settings.num_workers,
            prefetch: settings.prefetch.max(1),
        }
    }

    /// Same options without shuffling.
    pub fn sequential(&self) -> Self {
        Self {
            shuffle: false,
            ..self.clone()
        }
    }
}

/// Cut `0..len` into batches, shuffled with `seed + epoch` when requested.
pub fn batch_plan(len: usize, config: &LoaderConfig, epoch: usize) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    if config.shuffle {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(epoch as u64));
        indices.shuffle(&mut rng);
    }
    indices
        .chunks(config.batch_size.max(1))
        .map(<[usize]>::to_vec)
        .collect()
}

type AssembleFn<H> = fn(&PairedDataset, &[usize]) -> H;

/// Iterator over host batches for one epoch.
struct Prefetch<H> {
    source: Source<H>,
    expected: usize,
    received: usize,
}

enum Source<H> {
    Inline {
        dataset: Arc<PairedDataset>,
        plan: std::vec::IntoIter<Vec<usize>>,
        assemble: AssembleFn<H>,
    },
    Workers {
        rx: Option<Receiver<H>>,
        handles: Vec<JoinHandle<()>>,
    },
}

impl<H: Send + 'static> Prefetch<H> {
    fn spawn(
        dataset: Arc<PairedDataset>,
        plan: Vec<Vec<usize>>,
        assemble: AssembleFn<H>,
        num_workers: usize,
        prefetch: usize,
    ) -> Self {
        let expected = plan.len();
        if num_workers == 0 {
            return Self {
                source: Source::Inline {
                    dataset,
                    plan: plan.into_iter(),
                    assemble,
                },
                expected,
                received: 0,
            };
        }

        let (job_tx, job_rx) = unbounded::<Vec<usize>>();
        for job in plan {
            // receiver is alive: it is owned below
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let (tx, rx) = bounded::<H>(prefetch);
        let handles = (0..num_workers)
            .map(|_| {
                let dataset = Arc::clone(&dataset);
                let job_rx = job_rx.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        if tx.send(assemble(&dataset, &job)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            source: Source::Workers {
                rx: Some(rx),
                handles,
            },
            expected,
            received: 0,
        }
    }
}

impl<H> Iterator for Prefetch<H> {
    type Item = Result<H>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = match &mut self.source {
            Source::Inline {
                dataset,
                plan,
                assemble,
            } => plan.next().map(|job| assemble(&**dataset, &job)),
            Source::Workers { rx, .. } => rx.as_ref().and_then(|rx| rx.recv().ok()),
        };
        match item {
            Some(batch) => {
                self.received += 1;
                Some(Ok(batch))
            }
            None if self.received < self.expected => {
                let missing = self.expected - self.received;
                self.received = self.expected;
                Some(Err(CinetError::Data(format!(
                    "batch workers stopped with {missing} batches outstanding"
                ))))
            }
            None => None,
        }
    }
}

impl<H> Drop for Prefetch<H> {
    fn drop(&mut self) {
        if let Source::Workers { rx, handles } = &mut self.source {
            // closing the queue unblocks workers waiting on a full channel
            drop(rx.take());
            for handle in handles.drain(..) {
                if handle.join().is_err() {
                    tracing::warn!("batch worker panicked");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pair batches
// ---------------------------------------------------------------------------

struct HostPairs {
    gene_a: Vec<f32>,
    gene_b: Vec<f32>,
    labels: Vec<f32>,
    rows: usize,
}

fn assemble_pairs(dataset: &PairedDataset, indices: &[usize]) -> HostPairs {
    let width = dataset.gene_num();
    let mut host = HostPairs {
        gene_a: Vec::with_capacity(indices.len() * width),
        gene_b: Vec::with_capacity(indices.len() * width),
        labels: Vec::with_capacity(indices.len()),
        rows: 0,
    };
    for &k in indices {
        if let Some(DatasetItem::Pair {
            gene_a,
            gene_b,
            label,
        }) = dataset.get(k)
        {
            host.gene_a.extend_from_slice(gene_a);
            host.gene_b.extend_from_slice(gene_b);
            host.labels.push(label);
            host.rows += 1;
        }
    }
    host
}

/// A mini-batch of pairs on the compute device.
pub struct PairBatch {
    /// `[rows, width]` features of the first members.
    pub gene_a: Tensor,
    /// `[rows, width]` features of the second members.
    pub gene_b: Tensor,
    /// `[rows]` labels in {0, 1}.
    pub labels: Tensor,
    pub rows: usize,
}

/// Loader over a training-mode dataset.
pub struct PairLoader {
    dataset: Arc<PairedDataset>,
    config: LoaderConfig,
    device: Device,
}

impl PairLoader {
    pub fn new(dataset: Arc<PairedDataset>, config: LoaderConfig, device: &Device) -> Result<Self> {
        if dataset.mode() != DatasetMode::Train {
            return Err(CinetError::Config(
                "pair loader needs a training-mode dataset".to_string(),
            ));
        }
        Ok(Self {
            dataset,
            config,
            device: device.clone(),
        })
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.config.batch_size.max(1))
    }

    pub fn dataset(&self) -> &PairedDataset {
        &self.dataset
    }

    /// Batches for `epoch`.
    pub fn epoch(&self, epoch: usize) -> impl Iterator<Item = Result<PairBatch>> + '_ {
        let plan = batch_plan(self.dataset.len(), &self.config, epoch);
        let width = self.dataset.gene_num();
        Prefetch::spawn(
            Arc::clone(&self.dataset),
            plan,
            assemble_pairs,
            self.config.num_workers,
            self.config.prefetch,
        )
        .map(move |host| host.and_then(|host| self.to_device(host, width)))
    }

    fn to_device(&self, host: HostPairs, width: usize) -> Result<PairBatch> {
        let rows = host.rows;
        let map_err = |e: candle_core::Error| CinetError::Model(format!("Pair batch upload failed: {e}"));
        Ok(PairBatch {
            gene_a: Tensor::from_vec(host.gene_a, (rows, width), &self.device).map_err(map_err)?,
            gene_b: Tensor::from_vec(host.gene_b, (rows, width), &self.device).map_err(map_err)?,
            labels: Tensor::from_vec(host.labels, rows, &self.device).map_err(map_err)?,
            rows,
        })
    }
}

// ---------------------------------------------------------------------------
// Sample batches
// ---------------------------------------------------------------------------

struct HostSamples {
    genes: Vec<f32>,
    responses: Vec<f32>,
    cell_lines: Vec<String>,
}

fn assemble_samples(dataset: &PairedDataset, indices: &[usize]) -> HostSamples {
    let width = dataset.gene_num();
    let mut host = HostSamples {
        genes: Vec::with_capacity(indices.len() * width),
        responses: Vec::with_capacity(indices.len()),
        cell_lines: Vec::with_capacity(indices.len()),
    };
    for &k in indices {
        if let Some(DatasetItem::Sample {
            gene,
            response,
            cell_line,
        }) = dataset.get(k)
        {
            host.genes.extend_from_slice(gene);
            host.responses.push(response);
            host.cell_lines.push(cell_line.to_string());
        }
    }
    host
}

/// A mini-batch of single samples on the compute device.
pub struct SampleBatch {
    /// `[rows, width]` features.
    pub genes: Tensor,
    pub responses: Vec<f32>,
    pub cell_lines: Vec<String>,
}

/// Loader over an evaluation-mode dataset. Never shuffles.
pub struct SampleLoader {
    dataset: Arc<PairedDataset>,
    config: LoaderConfig,
    device: Device,
}

impl SampleLoader {
    pub fn new(dataset: Arc<PairedDataset>, config: LoaderConfig, device: &Device) -> Result<Self> {
        if dataset.mode() != DatasetMode::Eval {
            return Err(CinetError::Config(
                "sample loader needs an evaluation-mode dataset".to_string(),
            ));
        }
        Ok(Self {
            dataset,
            config: config.sequential(),
            device: device.clone(),
        })
    }

    pub fn batches(&self) -> impl Iterator<Item = Result<SampleBatch>> + '_ {
        let plan = batch_plan(self.dataset.len(), &self.config, 0);
        let width = self.dataset.gene_num();
        Prefetch::spawn(
            Arc::clone(&self.dataset),
            plan,
            assemble_samples,
            self.config.num_workers,
            self.config.prefetch,
        )
        .map(move |host| {
            host.and_then(|host| {
                let rows = host.responses.len();
                let genes = Tensor::from_vec(host.genes, (rows, width), &self.device)
                    .map_err(|e| CinetError::Model(format!("Sample batch upload failed: {e}")))?;
                Ok(SampleBatch {
                    genes,
                    responses: host.responses,
                    cell_lines: host.cell_lines,
                })
            })
        })
    }
}
