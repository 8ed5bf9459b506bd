use std::path::PathBuf;

use crate::model::{BackboneVariant, Normalization};
use crate::taxonomy::NUM_CLASSES;

// =============== HYPERPARAM & PATH ===============
pub const IMG_SIZE: u32 = 224;
pub const BATCH_SIZE: usize = 32;
pub const EPOCHS: usize = 20;
pub const FINE_TUNE_EPOCHS: usize = 10;
pub const LEARNING_RATE: f64 = 0.001;
pub const FINE_TUNE_LR_DIVISOR: f64 = 10.0;
pub const FINE_TUNE_AT: usize = 100;
pub const SHUFFLE_BUFFER: usize = 1000;
pub const SEED: u64 = 42;

pub const DATASET_PATH: &str = "dataset";
pub const PRETRAIN_PATH: &str = "weights/mobilenet_v3_small_imagenet.safetensors";
pub const MODEL_PATH: &str = "defect_classifier.safetensors";
pub const PLOT_PATH: &str = "training_results.png";

/// Everything the pipeline needs for one run. `Default` is the fixed
/// production setup; the `with_*` methods exist for tests and embedding.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub img_size: u32,
    pub batch_size: usize,
    pub num_classes: usize,
    pub epochs: usize,
    pub fine_tune_epochs: usize,
    pub learning_rate: f64,
    pub fine_tune_lr_divisor: f64,
    pub fine_tune_at: usize,
    pub shuffle_buffer: usize,
    pub seed: u64,
    pub variant: BackboneVariant,
    /// Has to match how the pretrained backbone was trained.
    pub normalization: Normalization,
    pub head_dropout: f64,
    pub hidden_units: i64,
    pub hidden_dropout: f64,
    pub dataset_path: PathBuf,
    /// `None` trains the backbone from random init.
    pub pretrained_path: Option<PathBuf>,
    pub model_path: PathBuf,
    pub plot_path: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            img_size: IMG_SIZE,
            batch_size: BATCH_SIZE,
            num_classes: NUM_CLASSES,
            epochs: EPOCHS,
            fine_tune_epochs: FINE_TUNE_EPOCHS,
            learning_rate: LEARNING_RATE,
            fine_tune_lr_divisor: FINE_TUNE_LR_DIVISOR,
            fine_tune_at: FINE_TUNE_AT,
            shuffle_buffer: SHUFFLE_BUFFER,
            seed: SEED,
            variant: BackboneVariant::Small,
            normalization: Normalization::ImageNet,
            head_dropout: 0.3,
            hidden_units: 128,
            hidden_dropout: 0.2,
            dataset_path: PathBuf::from(DATASET_PATH),
            pretrained_path: Some(PathBuf::from(PRETRAIN_PATH)),
            model_path: PathBuf::from(MODEL_PATH),
            plot_path: PathBuf::from(PLOT_PATH),
        }
    }
}

impl TrainConfig {
    pub fn with_img_size(mut self, img_size: u32) -> Self {
        self.img_size = img_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_epochs(mut self, epochs: usize, fine_tune_epochs: usize) -> Self {
        self.epochs = epochs;
        self.fine_tune_epochs = fine_tune_epochs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_variant(mut self, variant: BackboneVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_dataset_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dataset_path = path.into();
        self
    }

    pub fn with_pretrained_path(mut self, path: Option<PathBuf>) -> Self {
        self.pretrained_path = path;
        self
    }

    /// Puts both output files under `dir`, keeping their file names.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.model_path = dir.join(MODEL_PATH);
        self.plot_path = dir.join(PLOT_PATH);
        self
    }

    pub fn fine_tune_learning_rate(&self) -> f64 {
        self.learning_rate / self.fine_tune_lr_divisor
    }

    pub fn total_epochs(&self) -> usize {
        self.epochs + self.fine_tune_epochs
    }
}
