use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("split '{split}' not found at {path}")]
    MissingSplit { split: &'static str, path: PathBuf },
    #[error("split '{split}' has no images under {path}")]
    EmptySplit { split: &'static str, path: PathBuf },
    #[error("train and val class directories differ: train={train:?}, val={val:?}")]
    ClassMismatch { train: Vec<String>, val: Vec<String> },
    #[error("found {found} class directories, model expects {expected}")]
    ClassCount { found: usize, expected: usize },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("pretrained weights not found: {0}")]
    PretrainedMissing(PathBuf),
    #[error("no tensors copied from '{0}'")]
    NothingCopied(PathBuf),
    #[error("unsupported tensor dtype {dtype} for '{name}'")]
    UnsupportedDtype { name: String, dtype: String },
    #[error("safetensors: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
    #[error("torch: {0}")]
    Torch(#[from] tch::TchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("training already finished")]
    AlreadyDone,
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("torch: {0}")]
    Torch(#[from] tch::TchError),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("model has not finished training")]
    NotTrained,
    #[error("missing tensor '{0}' in variable store")]
    MissingTensor(String),
    #[error("safetensors: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
    #[error("torch: {0}")]
    Torch(#[from] tch::TchError),
    #[error("metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{0} has no classifier metadata")]
    MissingMetadata(PathBuf),
    #[error("artifact filled {copied} of {expected} model tensors")]
    IncompleteArtifact { copied: usize, expected: usize },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("safetensors: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
    #[error("torch: {0}")]
    Torch(#[from] tch::TchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
