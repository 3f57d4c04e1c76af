//! Sample tables, per-subset normalisation and the paired dataset.

use super::pairs::build_concordant_pairs;
use cinet_core::{CinetError, Pair, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::Path;

/// Raw samples as loaded from disk: identifier, features, response.
#[derive(Debug, Clone)]
pub struct SampleTable {
    ids: Vec<String>,
    feature_names: Vec<String>,
    /// Row-major `[len, width]` feature matrix.
    features: Vec<f32>,
    width: usize,
    responses: Vec<f32>,
}

impl SampleTable {
    /// Build a table from in-memory rows.
    ///
    /// Every row must have the same width and there must be one identifier
    /// and one response per row.
    pub fn new(ids: Vec<String>, rows: Vec<Vec<f32>>, responses: Vec<f32>) -> Result<Self> {
        if ids.len() != rows.len() || responses.len() != rows.len() {
            return Err(CinetError::Data(format!(
                "row count mismatch: {} ids, {} feature rows, {} responses",
                ids.len(),
                rows.len(),
                responses.len()
            )));
        }
        let width = rows.first().map_or(0, Vec::len);
        let mut features = Vec::with_capacity(rows.len() * width);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(CinetError::Data(format!(
                    "row {i} has {} features, expected {width}",
                    row.len()
                )));
            }
            features.extend_from_slice(row);
        }
        let feature_names = (0..width).map(|c| format!("f{c}")).collect();
        Ok(Self {
            ids,
            feature_names,
            features,
            width,
            responses,
        })
    }

    /// Load a CSV table.
    ///
    /// The first column is the sample identifier, `response_column` holds
    /// the response, and every other column is a numeric feature.
    pub fn from_csv(path: &Path, response_column: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| CinetError::Data(format!("Failed to open {}: {e}", path.display())))?;

        let headers = reader
            .headers()
            .map_err(|e| CinetError::Data(format!("Failed to read CSV header: {e}")))?
            .clone();
        let response_idx = headers
            .iter()
            .skip(1)
            .position(|h| h == response_column)
            .map(|p| p + 1)
            .ok_or_else(|| {
                CinetError::Config(format!(
                    "response column '{response_column}' not found in {}",
                    path.display()
                ))
            })?;
        let feature_cols: Vec<usize> = (1..headers.len()).filter(|&c| c != response_idx).collect();
        let feature_names: Vec<String> = feature_cols
            .iter()
            .map(|&c| headers[c].to_string())
            .collect();
        let width = feature_cols.len();

        let mut ids = Vec::new();
        let mut features = Vec::new();
        let mut responses = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record
                .map_err(|e| CinetError::Data(format!("Failed to read CSV row {row}: {e}")))?;
            if record.len() != headers.len() {
                return Err(CinetError::Data(format!(
                    "row {row} has {} columns, header has {}",
                    record.len(),
                    headers.len()
                )));
            }
            ids.push(record[0].to_string());
            responses.push(parse_cell(&record[response_idx], row, response_column)?);
            for &c in &feature_cols {
                features.push(parse_cell(&record[c], row, &headers[c])?);
            }
        }

        tracing::info!(
            path = %path.display(),
            samples = ids.len(),
            features = width,
            "Loaded sample table"
        );

        Ok(Self {
            ids,
            feature_names,
            features,
            width,
            responses,
        })
    }

    /// Select rows by index, in the given order.
    pub fn subset(&self, idxs: &[usize]) -> Result<Self> {
        let mut ids = Vec::with_capacity(idxs.len());
        let mut features = Vec::with_capacity(idxs.len() * self.width);
        let mut responses = Vec::with_capacity(idxs.len());
        for &i in idxs {
            if i >= self.len() {
                return Err(CinetError::Config(format!(
                    "row index {i} out of range for {} samples",
                    self.len()
                )));
            }
            ids.push(self.ids[i].clone());
            features.extend_from_slice(self.row(i));
            responses.push(self.responses[i]);
        }
        Ok(Self {
            ids,
            feature_names: self.feature_names.clone(),
            features,
            width: self.width,
            responses,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Feature width (number of feature columns).
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn responses(&self) -> &[f32] {
        &self.responses
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.features[i * self.width..(i + 1) * self.width]
    }
}

fn parse_cell(cell: &str, row: usize, column: &str) -> Result<f32> {
    cell.trim().parse::<f32>().map_err(|_| {
        CinetError::Data(format!(
            "row {row}, column '{column}': '{cell}' is not a number"
        ))
    })
}

/// Z-score every column of a row-major matrix in place.
///
/// Uses the population standard deviation. Returns the indices of
/// zero-variance columns, which end up as NaN.
pub fn standardize_columns(features: &mut [f32], width: usize) -> Vec<usize> {
    if width == 0 || features.is_empty() {
        return Vec::new();
    }
    let rows = features.len() / width;
    let mut constant = Vec::new();

    for c in 0..width {
        let mean = (0..rows).map(|r| f64::from(features[r * width + c])).sum::<f64>() / rows as f64;
        let var = (0..rows)
            .map(|r| {
                let d = f64::from(features[r * width + c]) - mean;
                d * d
            })
            .sum::<f64>()
            / rows as f64;
        let std = var.sqrt();
        if std == 0.0 {
            constant.push(c);
        }
        for r in 0..rows {
            let v = &mut features[r * width + c];
            *v = ((f64::from(*v) - mean) / std) as f32;
        }
    }
    constant
}

/// Addressing mode of a [`PairedDataset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetMode {
    /// Items are concordant pairs.
    Train,
    /// Items are single samples.
    Eval,
}

/// One item served by [`PairedDataset::get`].
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetItem<'a> {
    Pair {
        gene_a: &'a [f32],
        gene_b: &'a [f32],
        label: f32,
    },
    Sample {
        gene: &'a [f32],
        response: f32,
        cell_line: &'a str,
    },
}

/// Normalised features plus the pair index built over them.
///
/// Normalisation statistics come from the rows this dataset holds and are
/// fixed at construction.
#[derive(Debug, Clone)]
pub struct PairedDataset {
    ids: Vec<String>,
    features: Vec<f32>,
    width: usize,
    responses: Vec<f32>,
    pairs: Vec<Pair>,
    mode: DatasetMode,
}

impl PairedDataset {
    /// Build a dataset over `table`, optionally restricted to `idxs`.
    ///
    /// Subsetting happens before normalisation. Pairs are built only in
    /// [`DatasetMode::Train`].
    pub fn new(
        table: &SampleTable,
        mode: DatasetMode,
        delta: f32,
        batch_size: usize,
        idxs: Option<&[usize]>,
    ) -> Result<Self> {
        let table = match idxs {
            Some(idxs) => table.subset(idxs)?,
            None => table.clone(),
        };
        let SampleTable {
            ids,
            feature_names,
            mut features,
            width,
            responses,
        } = table;

        let constant = standardize_columns(&mut features, width);
        if !constant.is_empty() {
            let names: Vec<&str> = constant.iter().map(|&c| feature_names[c].as_str()).collect();
            tracing::warn!(
                columns = ?names,
                "Zero-variance feature columns normalise to NaN; filter them upstream"
            );
        }

        let pairs = match mode {
            DatasetMode::Train => build_concordant_pairs(&responses, delta, batch_size),
            DatasetMode::Eval => Vec::new(),
        };

        tracing::debug!(
            samples = ids.len(),
            width,
            pairs = pairs.len(),
            ?mode,
            "Built paired dataset"
        );

        Ok(Self {
            ids,
            features,
            width,
            responses,
            pairs,
            mode,
        })
    }

    /// Number of addressable items in the current mode.
    pub fn len(&self) -> usize {
        match self.mode {
            DatasetMode::Train => self.pairs.len(),
            DatasetMode::Eval => self.ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Item `k` in the current mode.
    pub fn get(&self, k: usize) -> Option<DatasetItem<'_>> {
        match self.mode {
            DatasetMode::Train => {
                let pair = self.pairs.get(k)?;
                Some(DatasetItem::Pair {
                    gene_a: self.gene(pair.idx_a),
                    gene_b: self.gene(pair.idx_b),
                    label: pair.target(),
                })
            }
            DatasetMode::Eval => {
                let cell_line = self.ids.get(k)?;
                Some(DatasetItem::Sample {
                    gene: self.gene(k),
                    response: self.responses[k],
                    cell_line,
                })
            }
        }
    }

    /// Normalised features of sample `idx`.
    pub fn gene(&self, idx: usize) -> &[f32] {
        &self.features[idx * self.width..(idx + 1) * self.width]
    }

    /// Feature width.
    pub fn gene_num(&self) -> usize {
        self.width
    }

    pub fn sample_count(&self) -> usize {
        self.ids.len()
    }

    pub fn pairs(&self) -> &[Pair] {
        &self.pairs
    }

    pub fn responses(&self) -> &[f32] {
        &self.responses
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn mode(&self) -> DatasetMode {
        self.mode
    }
}

/// Train/validation row split.
#[derive(Debug, Clone)]
pub struct DataSplit {
    pub train_indices: Vec<usize>,
    pub val_indices: Vec<usize>,
}

/// Shuffle `0..n` with a seeded RNG and hold out `ceil(n * val_ratio)` rows.
pub fn train_val_split(n: usize, val_ratio: f64, seed: u64) -> DataSplit {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let val_count = ((n as f64) * val_ratio).ceil() as usize;
    let val_indices = indices[..val_count.min(n)].to_vec();
    let train_indices = indices[val_count.min(n)..].to_vec();

    tracing::info!(
        train = train_indices.len(),
        val = val_indices.len(),
        seed,
        "Split samples"
    );

    DataSplit {
        train_indices,
        val_indices,
    }
}
