//! Convolutional allele classifier with an L2-penalised embedding layer.
//!
//! ```text
//! (N, L, A) one-hot
//!   -> 4 x [Conv1D(relu) -> MaxPool1D(4)]   filters 16/32/64/128, kernels 32/16/8/4
//!   -> flatten -> Dense(32)                  embedding, L2 activity penalty
//!   -> Dense(K) -> softmax                   class probabilities
//! ```
//!
//! The embedding and the classifier share one set of parameters: a
//! [`TrainedModel`] answers both `classify` and `embed`, and the
//! [`EmbeddingExtractor`] is only obtainable from a trained model.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{conv1d, linear, ops, Conv1d, Conv1dConfig, Linear, VarBuilder, VarMap};
use log::debug;
use ndarray::{s, Array1, Array2, Array3, ArrayView3};

use crate::config::{InferenceConfig, InputPrecision};
use crate::dataset::MAX_CLASSES;
use crate::errors::PipelineError;
use crate::train::TrainingHistory;

pub const CONV_FILTERS: [usize; 4] = [16, 32, 64, 128];
pub const CONV_KERNELS: [usize; 4] = [32, 16, 8, 4];
pub const POOL_SIZE: usize = 4;
pub const EMBEDDING_DIM: usize = 32;

/// Shortest input that survives every convolution and pooling stage.
pub fn min_input_length() -> usize {
    CONV_KERNELS
        .iter()
        .rev()
        .fold(1, |len, kernel| len * POOL_SIZE + kernel - 1)
}

/// Width of the flattened convolutional output for inputs of `input_length`.
pub fn flattened_width(input_length: usize) -> Result<usize> {
    let mut length = input_length;
    for kernel in CONV_KERNELS {
        if length < kernel {
            return Err(PipelineError::ShapeMismatch(format!(
                "input length {} is shorter than the network minimum of {}",
                input_length,
                min_input_length()
            ))
            .into());
        }
        length = (length - kernel + 1) / POOL_SIZE;
    }
    if length == 0 {
        return Err(PipelineError::ShapeMismatch(format!(
            "input length {} is shorter than the network minimum of {}",
            input_length,
            min_input_length()
        ))
        .into());
    }
    Ok(length * CONV_FILTERS[CONV_FILTERS.len() - 1])
}

fn max_pool1d(xs: &Tensor, size: usize) -> candle_core::Result<Tensor> {
    let (n, channels, length) = xs.dims3()?;
    let pooled = length / size;
    xs.narrow(2, 0, pooled * size)?
        .reshape((n, channels, pooled, size))?
        .max(D::Minus1)
}

/// A model that classifies reads and exposes its penultimate embedding.
pub trait AlleleClassifier {
    /// `(N, L, A)` input to `(N, EMBEDDING_DIM)` embeddings.
    fn embed(&self, xs: &Tensor) -> candle_core::Result<Tensor>;

    /// `(N, EMBEDDING_DIM)` embeddings to `(N, K)` unnormalised scores.
    fn head(&self, embedding: &Tensor) -> candle_core::Result<Tensor>;

    fn classify(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let logits = self.head(&self.embed(xs)?)?;
        ops::softmax(&logits, D::Minus1)
    }
}

#[derive(Debug)]
pub struct AlleleNet {
    convs: Vec<Conv1d>,
    embedding: Linear,
    classifier: Linear,
    input_length: usize,
    alphabet_width: usize,
    num_classes: usize,
}

impl AlleleNet {
    pub fn new(
        vb: VarBuilder,
        input_length: usize,
        alphabet_width: usize,
        num_classes: usize,
    ) -> Result<Self> {
        if num_classes == 0 || num_classes > MAX_CLASSES {
            return Err(PipelineError::ClassCountOverflow {
                classes: num_classes,
                capacity: MAX_CLASSES,
            }
            .into());
        }
        let flat = flattened_width(input_length)?;

        let mut convs = Vec::with_capacity(CONV_FILTERS.len());
        let mut in_channels = alphabet_width;
        for (stage, (&filters, &kernel)) in CONV_FILTERS.iter().zip(&CONV_KERNELS).enumerate() {
            convs.push(conv1d(
                in_channels,
                filters,
                kernel,
                Conv1dConfig::default(),
                vb.pp(format!("conv{}", stage + 1)),
            )?);
            in_channels = filters;
        }

        Ok(Self {
            convs,
            embedding: linear(flat, EMBEDDING_DIM, vb.pp("embedding"))?,
            classifier: linear(EMBEDDING_DIM, num_classes, vb.pp("classifier"))?,
            input_length,
            alphabet_width,
            num_classes,
        })
    }

    /// Embedding and logits in a single pass, for the training loss.
    pub fn forward_train(&self, xs: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let embedding = self.embed(xs)?;
        let logits = self.head(&embedding)?;
        Ok((embedding, logits))
    }

    pub fn input_shape(&self) -> (usize, usize) {
        (self.input_length, self.alphabet_width)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl AlleleClassifier for AlleleNet {
    fn embed(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // one-hot input arrives as (N, L, A); convolutions want (N, A, L)
        let mut h = xs.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?;
        for conv in &self.convs {
            h = max_pool1d(&conv.forward(&h)?.relu()?, POOL_SIZE)?;
        }
        self.embedding.forward(&h.flatten_from(1)?)
    }

    fn head(&self, embedding: &Tensor) -> candle_core::Result<Tensor> {
        self.classifier.forward(embedding)
    }
}

/// Copies the selected rows of a `u8` tensor onto the device.
pub fn rows_to_tensor(features: &Array3<u8>, rows: &[usize], device: &Device) -> Result<Tensor> {
    let (_, length, width) = features.dim();
    let mut buf = Vec::with_capacity(rows.len() * length * width);
    for &row in rows {
        buf.extend(features.slice(s![row, .., ..]).iter().copied());
    }
    Ok(Tensor::from_vec(buf, (rows.len(), length, width), device)?)
}

pub fn view_to_tensor(
    view: ArrayView3<u8>,
    precision: InputPrecision,
    device: &Device,
) -> Result<Tensor> {
    let dims = view.dim();
    let buf: Vec<u8> = view.iter().copied().collect();
    let tensor = Tensor::from_vec(buf, dims, device)?;
    let dtype = match precision {
        InputPrecision::Half => DType::F16,
        InputPrecision::Full => DType::F32,
    };
    Ok(tensor.to_dtype(dtype)?)
}

/// A classifier whose training has finished.
pub struct TrainedModel {
    net: AlleleNet,
    varmap: VarMap,
    device: Device,
    pub history: TrainingHistory,
}

impl TrainedModel {
    pub(crate) fn new(net: AlleleNet, varmap: VarMap, device: Device, history: TrainingHistory) -> Self {
        Self {
            net,
            varmap,
            device,
            history,
        }
    }

    pub fn input_shape(&self) -> (usize, usize) {
        self.net.input_shape()
    }

    pub fn num_classes(&self) -> usize {
        self.net.num_classes()
    }

    /// Class probabilities, shape `(N, K)`.
    pub fn predict_proba(&self, features: ArrayView3<u8>) -> Result<Array2<f32>> {
        let n = features.dim().0;
        let xs = view_to_tensor(features, InputPrecision::Full, &self.device)?;
        let probs = self.net.classify(&xs)?.to_vec2::<f32>()?;
        let flat: Vec<f32> = probs.into_iter().flatten().collect();
        Ok(Array2::from_shape_vec((n, self.num_classes()), flat)?)
    }

    /// Arg-max class per read, classified `chunk_size` reads at a time.
    pub fn predict_classes(&self, features: &Array3<u8>, config: &InferenceConfig) -> Result<Array1<u8>> {
        self.ensure_input_shape(features)?;
        let n = features.dim().0;
        let mut prediction = Array1::<u8>::zeros(n);
        for start in (0..n).step_by(config.chunk_size) {
            let end = (start + config.chunk_size).min(n);
            let classes = {
                let chunk = view_to_tensor(
                    features.slice(s![start..end, .., ..]),
                    config.precision,
                    &self.device,
                )?;
                self.net.classify(&chunk)?.argmax(D::Minus1)?.to_vec1::<u32>()?
            };
            for (slot, class) in prediction.slice_mut(s![start..end]).iter_mut().zip(classes) {
                *slot = u8::try_from(class).map_err(|_| PipelineError::ClassCountOverflow {
                    classes: class as usize + 1,
                    capacity: MAX_CLASSES,
                })?;
            }
            debug!("Classified reads {}..{} of {}", start, end, n);
        }
        Ok(prediction)
    }

    /// Fraction of reads whose arg-max class matches `classes`.
    pub fn accuracy(&self, features: &Array3<u8>, classes: &[u32], config: &InferenceConfig) -> Result<f32> {
        if classes.is_empty() {
            return Ok(0.0);
        }
        let full = InferenceConfig {
            precision: InputPrecision::Full,
            ..config.clone()
        };
        let predicted = self.predict_classes(features, &full)?;
        let correct = predicted
            .iter()
            .zip(classes)
            .filter(|&(&p, &c)| p as u32 == c)
            .count();
        Ok(correct as f32 / classes.len() as f32)
    }

    pub fn embedder(&self) -> EmbeddingExtractor<'_> {
        EmbeddingExtractor { model: self }
    }

    /// Writes the trained weights as safetensors.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .save(path)
            .with_context(|| format!("unable to save model to {}", path.display()))
    }

    pub fn ensure_input_shape(&self, features: &Array3<u8>) -> Result<()> {
        let (_, length, width) = features.dim();
        if (length, width) != self.input_shape() {
            let (l, a) = self.input_shape();
            return Err(PipelineError::ShapeMismatch(format!(
                "model expects reads of {}x{} but got {}x{}",
                l, a, length, width
            ))
            .into());
        }
        Ok(())
    }
}

/// Read-only view of a trained model up to its embedding layer.
pub struct EmbeddingExtractor<'a> {
    model: &'a TrainedModel,
}

impl EmbeddingExtractor<'_> {
    /// Embeddings, shape `(N, EMBEDDING_DIM)`.
    pub fn embed(&self, features: &Array3<u8>, batch_size: usize) -> Result<Array2<f32>> {
        self.model.ensure_input_shape(features)?;
        let batch_size = batch_size.max(1);
        let n = features.dim().0;
        let mut flat = Vec::with_capacity(n * EMBEDDING_DIM);
        for start in (0..n).step_by(batch_size) {
            let end = (start + batch_size).min(n);
            let xs = view_to_tensor(
                features.slice(s![start..end, .., ..]),
                InputPrecision::Full,
                &self.model.device,
            )?;
            let embedding = self.model.net.embed(&xs)?;
            flat.extend(embedding.flatten_all()?.to_vec1::<f32>()?);
        }
        Ok(Array2::from_shape_vec((n, EMBEDDING_DIM), flat)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(length: usize, classes: usize) -> (AlleleNet, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (AlleleNet::new(vb, length, 5, classes).unwrap(), varmap)
    }

    #[test]
    fn test_min_input_length() {
        assert_eq!(min_input_length(), 651);
        assert_eq!(flattened_width(651).unwrap(), 128);
        assert!(flattened_width(650).is_err());
        assert!(flattened_width(20).is_err());
        // 700 -> 669/4=167 -> 152/4=38 -> 31/4=7 -> 4/4=1
        assert_eq!(flattened_width(700).unwrap(), 128);
        // 2000 -> 1969/4=492 -> 477/4=119 -> 112/4=28 -> 25/4=6
        assert_eq!(flattened_width(2000).unwrap(), 128 * 6);
    }

    #[test]
    fn test_max_pool_floors() {
        let xs = Tensor::arange(0f32, 10., &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 10))
            .unwrap();
        let pooled = max_pool1d(&xs, 4).unwrap();
        assert_eq!(pooled.dims(), &[1, 1, 2]);
        assert_eq!(pooled.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![3., 7.]);
    }

    #[test]
    fn test_forward_shapes() {
        let (net, varmap) = net(min_input_length(), 3);
        assert!(!varmap.all_vars().is_empty());
        let xs = Tensor::zeros((4, min_input_length(), 5), DType::U8, &Device::Cpu).unwrap();
        let (embedding, logits) = net.forward_train(&xs).unwrap();
        assert_eq!(embedding.dims(), &[4, EMBEDDING_DIM]);
        assert_eq!(logits.dims(), &[4, 3]);

        let probs = net.classify(&xs).unwrap().sum(D::Minus1).unwrap();
        for total in probs.to_vec1::<f32>().unwrap() {
            assert!((total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_half_precision_input_matches_full() {
        let (net, _varmap) = net(min_input_length(), 2);
        let mut features = Array3::<u8>::zeros((3, min_input_length(), 5));
        for ((_, j, k), v) in features.indexed_iter_mut() {
            *v = u8::from(j % 5 == k);
        }
        let half = view_to_tensor(features.view(), InputPrecision::Half, &Device::Cpu).unwrap();
        let full = view_to_tensor(features.view(), InputPrecision::Full, &Device::Cpu).unwrap();
        assert_eq!(half.dtype(), DType::F16);
        let a = net.classify(&half).unwrap().to_vec2::<f32>().unwrap();
        let b = net.classify(&full).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    fn model(classes: usize) -> TrainedModel {
        let (net, varmap) = net(min_input_length(), classes);
        TrainedModel::new(net, varmap, Device::Cpu, TrainingHistory::default())
    }

    fn varied_reads(n: usize) -> Array3<u8> {
        let mut features = Array3::<u8>::zeros((n, min_input_length(), 5));
        for ((i, j, k), v) in features.indexed_iter_mut() {
            *v = u8::from((j * (i + 1) / 7) % 5 == k);
        }
        features
    }

    fn argmax_rows(probs: &Array2<f32>) -> Vec<u8> {
        probs
            .outer_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::MIN), |best, (k, &p)| if p > best.1 { (k, p) } else { best })
                    .0 as u8
            })
            .collect()
    }

    #[test]
    fn test_chunked_classes_match_probabilities() {
        let model = model(4);
        let features = varied_reads(10);
        let probs = model.predict_proba(features.view()).unwrap();
        assert_eq!(probs.dim(), (10, 4));
        for row in probs.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        let expected = argmax_rows(&probs);

        for precision in [InputPrecision::Half, InputPrecision::Full] {
            let config = InferenceConfig {
                chunk_size: 3,
                precision,
                ..InferenceConfig::default()
            };
            let classes = model.predict_classes(&features, &config).unwrap();
            assert_eq!(classes.to_vec(), expected);
        }
    }

    #[test]
    fn test_batched_embedding_matches_network() {
        let model = model(3);
        let features = varied_reads(10);
        let embedding = model.embedder().embed(&features, 4).unwrap();
        assert_eq!(embedding.dim(), (10, EMBEDDING_DIM));

        let xs = view_to_tensor(features.view(), InputPrecision::Full, &Device::Cpu).unwrap();
        let whole = model.net.embed(&xs).unwrap();
        let whole = whole.to_vec2::<f32>().unwrap();
        for (row, expected) in embedding.outer_iter().zip(&whole) {
            for (a, b) in row.iter().zip(expected) {
                assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
            }
        }

        // the head consumes the same embedding the extractor returns
        let logits = model.net.head(&whole_tensor(&embedding)).unwrap();
        let probs = ops::softmax(&logits, D::Minus1).unwrap().to_vec2::<f32>().unwrap();
        let direct = model.predict_proba(features.view()).unwrap();
        for (row, expected) in direct.outer_iter().zip(&probs) {
            for (a, b) in row.iter().zip(expected) {
                assert!((a - b).abs() < 1e-4);
            }
        }
    }

    fn whole_tensor(embedding: &Array2<f32>) -> Tensor {
        let flat: Vec<f32> = embedding.iter().copied().collect();
        Tensor::from_vec(flat, embedding.dim(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_inference_rejects_wrong_shape() {
        let model = model(2);
        let short = Array3::<u8>::zeros((2, 20, 5));
        assert!(model.predict_classes(&short, &InferenceConfig::default()).is_err());
        assert!(model.embedder().embed(&short, 4).is_err());
    }

    #[test]
    fn test_rejects_too_many_classes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = AlleleNet::new(vb, min_input_length(), 5, 256).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ClassCountOverflow { .. })
        ));
    }
}
