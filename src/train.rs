use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use log::{debug, info, warn};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::config::{EarlyStopping, TrainingConfig};
use crate::errors::PipelineError;
use crate::model::{rows_to_tensor, AlleleNet, TrainedModel};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
}

impl EpochMetrics {
    /// Quantity watched by early stopping.
    fn monitored(&self) -> f32 {
        self.val_loss.unwrap_or(self.loss)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
    pub stopped_early: bool,
}

/// Cross-entropy plus `alpha * sum(embedding^2) / batch`.
pub fn objective(embedding: &Tensor, logits: &Tensor, targets: &Tensor, alpha: f32) -> candle_core::Result<Tensor> {
    let batch = embedding.dim(0)?.max(1) as f64;
    let cross_entropy = loss::cross_entropy(logits, targets)?;
    let penalty = embedding
        .sqr()?
        .sum_all()?
        .affine(alpha as f64 / batch, 0.)?;
    cross_entropy.add(&penalty)
}

fn count_correct(logits: &Tensor, targets: &Tensor) -> candle_core::Result<f32> {
    logits
        .argmax(D::Minus1)?
        .eq(targets)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()
}

#[derive(Default)]
struct Running {
    loss: f32,
    correct: f32,
    seen: usize,
}

impl Running {
    fn add(&mut self, loss: f32, correct: f32, batch: usize) {
        self.loss += loss * batch as f32;
        self.correct += correct;
        self.seen += batch;
    }

    fn mean_loss(&self) -> f32 {
        self.loss / self.seen.max(1) as f32
    }

    fn accuracy(&self) -> f32 {
        self.correct / self.seen.max(1) as f32
    }
}

struct Stopper {
    rule: EarlyStopping,
    best: f32,
    wait: usize,
}

impl Stopper {
    fn new(rule: EarlyStopping) -> Self {
        Self {
            rule,
            best: f32::INFINITY,
            wait: 0,
        }
    }

    fn should_stop(&mut self, current: f32) -> bool {
        if current < self.best - self.rule.min_delta {
            self.best = current;
            self.wait = 0;
            return false;
        }
        self.wait += 1;
        self.wait >= self.rule.patience
    }
}

fn targets_tensor(classes: &[u32], rows: &[usize], device: &Device) -> Result<Tensor> {
    let targets: Vec<u32> = rows.iter().map(|&r| classes[r]).collect();
    Ok(Tensor::from_vec(targets, rows.len(), device)?)
}

fn evaluate(
    net: &AlleleNet,
    features: &Array3<u8>,
    classes: &[u32],
    rows: &[usize],
    config: &TrainingConfig,
    device: &Device,
) -> Result<Running> {
    let mut running = Running::default();
    for batch in rows.chunks(config.batch_size) {
        let xs = rows_to_tensor(features, batch, device)?;
        let ys = targets_tensor(classes, batch, device)?;
        let (embedding, logits) = net.forward_train(&xs)?;
        let loss = objective(&embedding, &logits, &ys, config.activity_l2)?.to_scalar::<f32>()?;
        running.add(loss, count_correct(&logits, &ys)?, batch.len());
    }
    Ok(running)
}

/// First validation row: `floor(n * (1 - split))`, the last `split` of the rows
/// being held back.
pub fn validation_start(n: usize, split: f64) -> usize {
    ((n as f64) * (1.0 - split)) as usize
}

/// Trains the classifier on `(N, L, A)` features with integer class ids.
///
/// The last `validation_split` of the rows is held back for validation
/// metrics; the remaining rows are reshuffled every epoch.
pub fn train_classifier(
    features: &Array3<u8>,
    classes: &[u32],
    num_classes: usize,
    config: &TrainingConfig,
    seed: u64,
    device: &Device,
) -> Result<TrainedModel> {
    let (n, length, width) = features.dim();
    if n == 0 {
        return Err(PipelineError::EmptyPartition("training").into());
    }
    if classes.len() != n {
        return Err(PipelineError::ShapeMismatch(format!(
            "{} training reads but {} labels",
            n,
            classes.len()
        ))
        .into());
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let net = AlleleNet::new(vb, length, width, num_classes)?;
    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: config.learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            weight_decay: 0.0,
        },
    )?;

    let mut split_at = validation_start(n, config.validation_split);
    if split_at == 0 {
        warn!("Too few training reads ({}) for a validation split; validating on none", n);
        split_at = n;
    }
    let mut fit_rows: Vec<usize> = (0..split_at).collect();
    let val_rows: Vec<usize> = (split_at..n).collect();
    info!(
        "Training on {} reads ({} validation), input {}x{}, {} classes",
        fit_rows.len(),
        val_rows.len(),
        length,
        width,
        num_classes
    );

    let mut rng = StdRng::seed_from_u64(seed);
    let mut stopper = config.early_stopping.map(Stopper::new);
    let mut history = TrainingHistory::default();

    for epoch in 1..=config.epochs {
        fit_rows.shuffle(&mut rng);
        let mut running = Running::default();
        for batch in fit_rows.chunks(config.batch_size) {
            let xs = rows_to_tensor(features, batch, device)?;
            let ys = targets_tensor(classes, batch, device)?;
            let (embedding, logits) = net.forward_train(&xs)?;
            let loss = objective(&embedding, &logits, &ys, config.activity_l2)?;
            optimizer.backward_step(&loss)?;

            let batch_loss = loss.to_scalar::<f32>()?;
            if !batch_loss.is_finite() {
                return Err(PipelineError::TrainingDiverged {
                    epoch,
                    loss: batch_loss,
                }
                .into());
            }
            running.add(batch_loss, count_correct(&logits, &ys)?, batch.len());
            debug!("epoch {} batch loss {:.4}", epoch, batch_loss);
        }

        let validation = if val_rows.is_empty() {
            None
        } else {
            Some(evaluate(&net, features, classes, &val_rows, config, device)?)
        };
        let metrics = EpochMetrics {
            epoch,
            loss: running.mean_loss(),
            accuracy: running.accuracy(),
            val_loss: validation.as_ref().map(Running::mean_loss),
            val_accuracy: validation.as_ref().map(Running::accuracy),
        };
        match (metrics.val_loss, metrics.val_accuracy) {
            (Some(val_loss), Some(val_accuracy)) => info!(
                "Epoch {}/{}: loss {:.4} accuracy {:.4} val_loss {:.4} val_accuracy {:.4}",
                epoch, config.epochs, metrics.loss, metrics.accuracy, val_loss, val_accuracy
            ),
            _ => info!(
                "Epoch {}/{}: loss {:.4} accuracy {:.4}",
                epoch, config.epochs, metrics.loss, metrics.accuracy
            ),
        }

        let monitored = metrics.monitored();
        history.epochs.push(metrics);
        if let Some(stopper) = stopper.as_mut() {
            if stopper.should_stop(monitored) {
                info!("Early stopping after epoch {}", epoch);
                history.stopped_early = true;
                break;
            }
        }
    }

    Ok(TrainedModel::new(net, varmap, device.clone(), history))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::min_input_length;

    fn toy_features(n: usize) -> (Array3<u8>, Vec<u32>) {
        let length = min_input_length();
        let mut features = Array3::<u8>::zeros((n, length, 5));
        let mut classes = Vec::with_capacity(n);
        for i in 0..n {
            let class = (i % 2) as u32;
            // class 0 is all matches, class 1 carries a deletion block
            for j in 0..length {
                let symbol = if class == 1 && (200..400).contains(&j) { 2 } else { 0 };
                features[[i, j, symbol]] = 1;
            }
            classes.push(class);
        }
        (features, classes)
    }

    #[test]
    fn test_objective_adds_activity_penalty() {
        let device = Device::Cpu;
        let embedding = Tensor::new(&[[1f32, 2.], [0., 1.]], &device).unwrap();
        let logits = Tensor::new(&[[0f32, 0.], [0., 0.]], &device).unwrap();
        let targets = Tensor::new(&[0u32, 1], &device).unwrap();
        let value = objective(&embedding, &logits, &targets, 0.1)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // ln 2 + 0.1 * 6 / 2
        assert!((value - (2f32.ln() + 0.3)).abs() < 1e-5);
    }

    #[test]
    fn test_validation_rows() {
        let split = TrainingConfig::default().validation_split;
        assert_eq!(validation_start(80, split), 64);
        assert_eq!(validation_start(100, split), 80);
        assert_eq!(validation_start(7, split), 5);
        assert_eq!(validation_start(3, 0.0), 3);
        for n in (5..=400).step_by(5) {
            assert_eq!(n - validation_start(n, split), n / 5, "n = {}", n);
        }
    }

    #[test]
    fn test_stopper_patience() {
        let mut stopper = Stopper::new(EarlyStopping {
            patience: 2,
            min_delta: 0.0,
        });
        assert!(!stopper.should_stop(1.0));
        assert!(!stopper.should_stop(0.5));
        assert!(!stopper.should_stop(0.6));
        assert!(stopper.should_stop(0.7));
    }

    #[test]
    fn test_training_learns_separable_classes() {
        let (features, classes) = toy_features(40);
        let config = TrainingConfig {
            epochs: 5,
            batch_size: 8,
            ..TrainingConfig::default()
        };
        let model = train_classifier(&features, &classes, 2, &config, 3, &Device::Cpu).unwrap();
        assert_eq!(model.history.epochs.len(), 5);
        assert!(model.history.epochs.iter().all(|m| m.val_loss.is_some()));
        let first = model.history.epochs[0].loss;
        let last = model.history.epochs[4].loss;
        assert!(last < first, "loss did not decrease: {} -> {}", first, last);
    }

    #[test]
    fn test_label_count_must_match() {
        let (features, classes) = toy_features(4);
        let err = train_classifier(
            &features,
            &classes[..3],
            2,
            &TrainingConfig::default(),
            0,
            &Device::Cpu,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ShapeMismatch(_))
        ));
    }
}
