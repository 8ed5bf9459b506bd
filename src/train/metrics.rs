use tch::{Device, Kind, Tensor};

use crate::data::{batch_indices, for_each_batch, ImageSet};
use crate::error::TrainError;
use crate::model::DefectNet;

/// Mean categorical cross-entropy of `logits` against one-hot `labels`.
pub fn categorical_cross_entropy(logits: &Tensor, labels: &Tensor) -> Tensor {
    let n = logits.size()[0].max(1) as f64;
    -(labels * logits.log_softmax(-1, Kind::Float)).sum(Kind::Float) / n
}

/// Number of rows whose arg-max matches `targets`.
pub fn correct_predictions(logits: &Tensor, targets: &Tensor) -> i64 {
    logits
        .argmax(-1, false)
        .eq_tensor(targets)
        .sum(Kind::Int64)
        .int64_value(&[])
}

/// Running sample-weighted loss and accuracy over an epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningMetrics {
    loss_sum: f64,
    correct: i64,
    seen: i64,
}

impl RunningMetrics {
    pub fn update(&mut self, batch_loss: f64, correct: i64, batch_size: i64) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.correct += correct;
        self.seen += batch_size;
    }

    pub fn seen(&self) -> i64 {
        self.seen
    }

    pub fn loss(&self) -> f64 {
        if self.seen > 0 { self.loss_sum / self.seen as f64 } else { 0.0 }
    }

    pub fn accuracy(&self) -> f64 {
        if self.seen > 0 { self.correct as f64 / self.seen as f64 } else { 0.0 }
    }
}

/// Loss and accuracy over `set` without augmentation or dropout.
pub fn eval_stream(
    net: &DefectNet,
    set: &ImageSet,
    num_classes: usize,
    batch_size: usize,
    depth: usize,
    device: Device,
) -> Result<(f64, f64), TrainError> {
    let _guard = tch::no_grad_guard();
    let order = batch_indices(set.len(), batch_size);
    let mut running = RunningMetrics::default();
    for_each_batch(set, &order, num_classes, depth, device, |batch| {
        let logits = net.logits(&batch.images, false);
        let loss = categorical_cross_entropy(&logits, &batch.labels).double_value(&[]);
        running.update(loss, correct_predictions(&logits, &batch.targets), batch.size());
        Ok::<(), TrainError>(())
    })?;
    Ok((running.loss(), running.accuracy()))
}
