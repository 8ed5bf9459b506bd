//! Defect image classifier: MobileNetV3 transfer learning on a directory
//! dataset, exported as a half-precision safetensors artifact.

pub mod augment;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod inference;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod taxonomy;
pub mod train;

pub use config::TrainConfig;
pub use error::{DatasetError, ExportError, InferenceError, ModelError, TrainError};
pub use inference::{Classification, DefectClassifier};
pub use model::{BackboneVariant, DefectNet, Normalization};
pub use pipeline::{run, PipelineOutcome};
pub use taxonomy::{DefectClass, InspectionKind, CLASS_NAMES, NUM_CLASSES};
