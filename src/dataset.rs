use std::collections::HashMap;

use anyhow::Result;
use log::info;
use ndarray::{Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::encoding::SequenceEncoder;
use crate::errors::PipelineError;
use crate::seqreader::ReadRecord;

/// Class ids are stored as `u8` predictions.
pub const MAX_CLASSES: usize = u8::MAX as usize;
pub const SIMULATED_SUFFIX: &str = "_simulated";

/// Class id to barcode name, in first-occurrence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelIndex {
    names: Vec<String>,
}

impl LabelIndex {
    /// Factorizes barcodes into `(index, class id per barcode)`.
    pub fn factorize<'a, I>(barcodes: I) -> (Self, Vec<u32>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut names: Vec<String> = Vec::new();
        let mut ids: HashMap<&'a str, u32> = HashMap::new();
        let classes = barcodes
            .into_iter()
            .map(|barcode| {
                *ids.entry(barcode).or_insert_with(|| {
                    names.push(barcode.to_string());
                    (names.len() - 1) as u32
                })
            })
            .collect();
        (Self { names }, classes)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, class: usize) -> Option<&str> {
        self.names.get(class).map(String::as_str)
    }

    /// Barcode name with the `_simulated` suffix removed.
    pub fn class_name(&self, class: usize) -> Option<&str> {
        self.name(class).map(|n| n.strip_suffix(SIMULATED_SUFFIX).unwrap_or(n))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn ensure_capacity(&self) -> Result<()> {
        if self.len() > MAX_CLASSES {
            return Err(PipelineError::ClassCountOverflow {
                classes: self.len(),
                capacity: MAX_CLASSES,
            }
            .into());
        }
        Ok(())
    }
}

/// Simulated reads split into training and held-out subsets.
#[derive(Debug)]
pub struct Dataset {
    pub train_features: Array3<u8>,
    pub test_features: Array3<u8>,
    /// One-hot, shape `(n, K)`.
    pub train_labels: Array2<u8>,
    pub test_labels: Array2<u8>,
    pub train_classes: Vec<u32>,
    pub test_classes: Vec<u32>,
    pub label_index: LabelIndex,
}

impl Dataset {
    /// Drops the held-out half, returning its size.
    pub fn release_holdout(&mut self) -> usize {
        let held_out = self.test_classes.len();
        let (_, length, width) = self.test_features.dim();
        self.test_features = Array3::zeros((0, length, width));
        self.test_labels = Array2::zeros((0, self.label_index.len()));
        self.test_classes = Vec::new();
        held_out
    }
}

pub fn one_hot_labels(classes: &[u32], num_classes: usize) -> Array2<u8> {
    let mut labels = Array2::zeros((classes.len(), num_classes));
    for (row, &class) in classes.iter().enumerate() {
        labels[[row, class as usize]] = 1;
    }
    labels
}

/// Number of held-out rows for `total` reads: `ceil(total * test_fraction)`,
/// evaluated in f64 exactly as scikit-learn's `train_test_split` does, so a
/// product that lands just above an integer rounds up.
pub fn held_out_size(total: usize, test_fraction: f64) -> usize {
    ((total as f64) * test_fraction).ceil().max(0.0) as usize
}

/// Returns shuffled `(train, test)` row indices.
pub fn shuffle_split(total: usize, test_fraction: f64, rng: &mut StdRng) -> (Vec<usize>, Vec<usize>) {
    let mut rows: Vec<usize> = (0..total).collect();
    rows.shuffle(rng);
    let test = held_out_size(total, test_fraction).min(total);
    let train = rows.split_off(test);
    (train, rows)
}

pub fn split_simulated(
    simulated: &[ReadRecord],
    encoder: &SequenceEncoder,
    test_fraction: f64,
    seed: u64,
) -> Result<Dataset> {
    if simulated.is_empty() {
        return Err(PipelineError::EmptyPartition("simulated").into());
    }
    let (label_index, classes) =
        LabelIndex::factorize(simulated.iter().map(|r| r.barcode_id.as_str()));
    label_index.ensure_capacity()?;

    let features = {
        let seqs: Vec<&str> = simulated.iter().map(|r| r.seq.as_str()).collect();
        encoder.encode(&seqs)?
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let (train_rows, test_rows) = shuffle_split(simulated.len(), test_fraction, &mut rng);
    let pick = |rows: &[usize]| rows.iter().map(|&r| classes[r]).collect::<Vec<_>>();
    let train_classes = pick(&train_rows);
    let test_classes = pick(&test_rows);

    let train_features = features.select(Axis(0), &train_rows);
    let test_features = features.select(Axis(0), &test_rows);
    drop(features);

    info!(
        "Split {} simulated reads into {} training and {} held-out reads across {} classes",
        simulated.len(),
        train_rows.len(),
        test_rows.len(),
        label_index.len()
    );

    Ok(Dataset {
        train_labels: one_hot_labels(&train_classes, label_index.len()),
        test_labels: one_hot_labels(&test_classes, label_index.len()),
        train_features,
        test_features,
        train_classes,
        test_classes,
        label_index,
    })
}
