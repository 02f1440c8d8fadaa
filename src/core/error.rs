use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClipError>;

/// Everything that can go wrong between opening a checkpoint and returning an embedding.
///
/// Loader variants are terminal for the load attempt: no partially built context
/// is ever handed back.
#[derive(Error, Debug)]
pub enum ClipError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid model file: {0}")]
    InvalidFormat(String),

    #[error("unsupported weight type code {0}")]
    UnsupportedWeightType(i32),

    #[error("vocabulary size mismatch: file declares {declared}, text hparams expect {expected}")]
    VocabSizeMismatch { declared: i32, expected: i32 },

    #[error("invalid hyperparameters: {0}")]
    InvalidHyperparameters(String),

    #[error("unknown tensor '{0}' in model file")]
    UnknownTensor(String),

    #[error("tensor '{0}' appears more than once in model file")]
    DuplicateTensor(String),

    #[error("tensor '{0}' is missing from model file")]
    MissingTensor(String),

    #[error("tensor '{name}' has wrong shape: got {got:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: [usize; 4],
        got: [usize; 4],
    },

    #[error("tensor '{name}' has wrong size: got {got} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("weight arena exhausted: requested {requested} bytes, {available} available")]
    AllocationFailure { requested: usize, available: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
