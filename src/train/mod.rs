//! Two-phase transfer-learning loop: head-only training on a frozen
//! backbone, then fine-tuning of the backbone tail at a lower learning rate.

pub mod history;
pub mod metrics;

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::{nn, nn::OptimizerConfig, Device};

use crate::augment::Augmentation;
use crate::config::TrainConfig;
use crate::data::{autotune_depth, for_each_batch, shuffled_batches, DatasetSplits};
use crate::error::TrainError;
use crate::model::{DefectNet, FreezePolicy, TrainableVars};

pub use history::{EpochMetrics, History};
pub use metrics::{categorical_cross_entropy, correct_predictions, eval_stream, RunningMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    FrozenTraining,
    FineTuning,
    Done,
}

/// Hyperparameters the loop reads from [`TrainConfig`].
#[derive(Debug, Clone, Copy)]
struct Schedule {
    epochs: usize,
    fine_tune_epochs: usize,
    learning_rate: f64,
    fine_tune_learning_rate: f64,
    fine_tune_at: usize,
    batch_size: usize,
    shuffle_buffer: usize,
    num_classes: usize,
}

impl From<&TrainConfig> for Schedule {
    fn from(cfg: &TrainConfig) -> Self {
        Self {
            epochs: cfg.epochs,
            fine_tune_epochs: cfg.fine_tune_epochs,
            learning_rate: cfg.learning_rate,
            fine_tune_learning_rate: cfg.fine_tune_learning_rate(),
            fine_tune_at: cfg.fine_tune_at,
            batch_size: cfg.batch_size,
            shuffle_buffer: cfg.shuffle_buffer,
            num_classes: cfg.num_classes,
        }
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Owns the model between phases. The model is only mutated through
/// [`Trainer::run_phase`].
pub struct Trainer {
    vs: nn::VarStore,
    net: DefectNet,
    trainable: TrainableVars,
    phase: Phase,
    schedule: Schedule,
    augmentation: Augmentation,
    rng: StdRng,
    device: Device,
    prefetch: usize,
    frozen_history: History,
    fine_tune_history: History,
}

impl Trainer {
    /// Starts in [`Phase::FrozenTraining`] with the whole backbone frozen.
    pub fn new(vs: nn::VarStore, net: DefectNet, cfg: &TrainConfig) -> Self {
        let device = vs.device();
        let trainable = TrainableVars::capture(&vs);
        let summary = trainable.apply(&vs, &net, FreezePolicy::FrozenBackbone);
        info!(
            "✓ Frozen backbone params: {} (trainable: {})",
            summary.frozen, summary.trainable
        );
        Self {
            vs,
            net,
            trainable,
            phase: Phase::FrozenTraining,
            schedule: Schedule::from(cfg),
            augmentation: Augmentation::default(),
            rng: StdRng::seed_from_u64(cfg.seed),
            device,
            prefetch: autotune_depth(),
            frozen_history: History::default(),
            fine_tune_history: History::default(),
        }
    }

    pub fn with_augmentation(mut self, augmentation: Augmentation) -> Self {
        self.augmentation = augmentation;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn net(&self) -> &DefectNet {
        &self.net
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Learning rate the current phase trains with; `None` once done.
    pub fn learning_rate(&self) -> Option<f64> {
        match self.phase {
            Phase::FrozenTraining => Some(self.schedule.learning_rate),
            Phase::FineTuning => Some(self.schedule.fine_tune_learning_rate),
            Phase::Done => None,
        }
    }

    pub fn frozen_history(&self) -> &History {
        &self.frozen_history
    }

    pub fn fine_tune_history(&self) -> &History {
        &self.fine_tune_history
    }

    /// Runs the current phase to completion and moves to the next one.
    pub fn run_phase(&mut self, data: &DatasetSplits) -> Result<Phase, TrainError> {
        let lr = self.learning_rate().ok_or(TrainError::AlreadyDone)?;
        match self.phase {
            Phase::FrozenTraining => {
                info!("🏋️ Phase 1: transfer learning ({} epochs, lr {lr})", self.schedule.epochs);
                self.frozen_history = self.fit(data, self.schedule.epochs, lr)?;
                self.unfreeze_tail();
                self.phase = Phase::FineTuning;
            }
            Phase::FineTuning => {
                info!("🔧 Phase 2: fine-tuning ({} epochs, lr {lr})", self.schedule.fine_tune_epochs);
                self.fine_tune_history = self.fit(data, self.schedule.fine_tune_epochs, lr)?;
                self.phase = Phase::Done;
            }
            Phase::Done => return Err(TrainError::AlreadyDone),
        }
        Ok(self.phase)
    }

    /// Runs every remaining phase.
    pub fn run(&mut self, data: &DatasetSplits) -> Result<(), TrainError> {
        while self.phase != Phase::Done {
            self.run_phase(data)?;
        }
        Ok(())
    }

    pub fn into_parts(self) -> (nn::VarStore, DefectNet, History, History) {
        (self.vs, self.net, self.frozen_history, self.fine_tune_history)
    }

    fn unfreeze_tail(&mut self) {
        let at = self.schedule.fine_tune_at;
        let summary = self
            .trainable
            .apply(&self.vs, &self.net, FreezePolicy::FineTuneFrom(at));
        info!(
            "✓ Backbone layers before {} re-frozen: {} frozen / {} trainable params",
            at, summary.frozen, summary.trainable
        );
    }

    fn fit(&mut self, data: &DatasetSplits, epochs: usize, lr: f64) -> Result<History, TrainError> {
        if data.train.is_empty() {
            return Err(TrainError::EmptyTrainingSet);
        }
        let mut opt = nn::Adam::default().build(&self.vs, lr)?;
        let schedule = self.schedule;
        let mut history = History::default();

        let epoch_pb = ProgressBar::new(epochs as u64);
        epoch_pb.set_style(
            bar_style(" {spinner:.yellow} [Epoch {pos}/{len}] {wide_msg}")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        for epoch in 1..=epochs {
            let order = shuffled_batches(
                data.train.len(),
                schedule.batch_size,
                schedule.shuffle_buffer,
                &mut self.rng,
            );

            let batch_pb = ProgressBar::new(data.train.len() as u64);
            batch_pb.set_style(
                bar_style(
                    "  [ep {prefix}] {elapsed_precise} │{bar:48.magenta/blue}│ {percent:>3}% {pos}/{len} • eta {eta_precise} • {msg}",
                )
                .progress_chars("█▓░"),
            );
            batch_pb.set_prefix(epoch.to_string());

            let net = &self.net;
            let augmentation = &self.augmentation;
            let mut running = RunningMetrics::default();
            for_each_batch(
                &data.train,
                &order,
                schedule.num_classes,
                self.prefetch,
                self.device,
                |batch| {
                    let xs = augmentation.apply(&batch.images);
                    let logits = net.logits(&xs, true);
                    let loss = categorical_cross_entropy(&logits, &batch.labels);
                    opt.backward_step(&loss);

                    let correct = tch::no_grad(|| correct_predictions(&logits, &batch.targets));
                    running.update(loss.double_value(&[]), correct, batch.size());
                    batch_pb.set_message(format!(
                        "loss {:.4} • acc {:.2}%",
                        running.loss(),
                        running.accuracy() * 100.0
                    ));
                    batch_pb.inc(batch.size() as u64);
                    Ok::<(), TrainError>(())
                },
            )?;
            batch_pb.finish_and_clear();

            let (val_loss, val_accuracy) = eval_stream(
                net,
                &data.val,
                schedule.num_classes,
                schedule.batch_size,
                self.prefetch,
                self.device,
            )?;
            let metrics = EpochMetrics {
                loss: running.loss(),
                accuracy: running.accuracy(),
                val_loss,
                val_accuracy,
            };
            epoch_pb.set_message(format!(
                "val_loss {val_loss:.4} • val_acc {:.2}%",
                val_accuracy * 100.0
            ));
            epoch_pb.inc(1);
            epoch_pb.println(format!(
                "Epoch {epoch}/{epochs} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
                metrics.loss, metrics.accuracy, metrics.val_loss, metrics.val_accuracy
            ));
            history.push(metrics);
        }
        epoch_pb.finish_with_message("phase done");
        Ok(history)
    }
}
