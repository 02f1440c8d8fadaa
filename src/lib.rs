//! CLIP inference on the CPU: load a ggml-format checkpoint, embed texts and images into a
//! shared space, and compare them.

pub mod core;

pub use crate::core::config::{Activation, Letterbox, LoadOptions, PreprocessOptions};
pub use crate::core::error::{ClipError, Result};
pub use crate::core::image::{preprocess_batch, preprocess_image};
pub use crate::core::similarity::{rank, similarity, try_similarity};
pub use crate::core::types::{ClipContext, ImageF32, ImageU8, Ranking, Scratch, Tokenization};
