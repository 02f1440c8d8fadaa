use std::sync::Arc;

use regex::Regex;
use serde::Serialize;

use crate::core::config::Activation;
use crate::core::names::{LayerTensor, TensorSlot};
use crate::core::tensor::{TensorId, WeightArena, WeightType};

// Model hyperparameters, in checkpoint order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextHparams {
    pub n_vocab: i32,         // vocabulary size, 49408 for OpenAI CLIP
    pub num_positions: i32,   // max sequence length
    pub hidden_size: i32,     // transformer width
    pub n_intermediate: i32,  // FFN width
    pub projection_dim: i32,  // shared embedding width
    pub n_head: i32,          // attention heads
    pub n_layer: i32          // transformer blocks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisionHparams {
    pub image_size: i32,      // square input side in pixels
    pub patch_size: i32,      // square patch side in pixels
    pub hidden_size: i32,
    pub n_intermediate: i32,
    pub projection_dim: i32,
    pub n_head: i32,
    pub n_layer: i32
}

impl TextHparams {
    pub fn hidden(&self) -> usize {
        self.hidden_size as usize
    }

    pub fn head_dim(&self) -> usize {
        (self.hidden_size / self.n_head) as usize
    }
}

impl VisionHparams {
    pub fn hidden(&self) -> usize {
        self.hidden_size as usize
    }

    pub fn head_dim(&self) -> usize {
        (self.hidden_size / self.n_head) as usize
    }

    pub fn grid(&self) -> usize {
        (self.image_size / self.patch_size) as usize
    }

    pub fn num_patches(&self) -> usize {
        self.grid() * self.grid()
    }

    // patches plus the class token
    pub fn num_positions(&self) -> usize {
        self.num_patches() + 1
    }
}

// -------------------------------------------------------------------------------------------------
// Weight tables. Every field is an index into the context's WeightArena.
#[derive(Debug, Clone, Copy)]
pub struct Layer {
    // attention
    pub q_w: TensorId,
    pub q_b: TensorId,
    pub k_w: TensorId,
    pub k_b: TensorId,
    pub v_w: TensorId,
    pub v_b: TensorId,
    pub o_w: TensorId,
    pub o_b: TensorId,
    // layernorm 1
    pub ln_1_w: TensorId,
    pub ln_1_b: TensorId,
    // ffn
    pub ff_i_w: TensorId,
    pub ff_i_b: TensorId,
    pub ff_o_w: TensorId,
    pub ff_o_b: TensorId,
    // layernorm 2
    pub ln_2_w: TensorId,
    pub ln_2_b: TensorId
}

impl Layer {
    pub fn tensor(&self, t: LayerTensor) -> TensorId {
        match t {
            LayerTensor::QueryWeight => self.q_w,
            LayerTensor::QueryBias => self.q_b,
            LayerTensor::KeyWeight => self.k_w,
            LayerTensor::KeyBias => self.k_b,
            LayerTensor::ValueWeight => self.v_w,
            LayerTensor::ValueBias => self.v_b,
            LayerTensor::OutWeight => self.o_w,
            LayerTensor::OutBias => self.o_b,
            LayerTensor::Norm1Weight => self.ln_1_w,
            LayerTensor::Norm1Bias => self.ln_1_b,
            LayerTensor::Fc1Weight => self.ff_i_w,
            LayerTensor::Fc1Bias => self.ff_i_b,
            LayerTensor::Fc2Weight => self.ff_o_w,
            LayerTensor::Fc2Bias => self.ff_o_b,
            LayerTensor::Norm2Weight => self.ln_2_w,
            LayerTensor::Norm2Bias => self.ln_2_b,
        }
    }
}

pub struct TextModel {
    pub hparams: TextHparams,
    pub token_embeddings: TensorId,     // (n_vocab, hidden)
    pub position_embeddings: TensorId,  // (num_positions, hidden)
    pub layers: Vec<Layer>,
    pub post_ln_w: TensorId,            // final_layer_norm
    pub post_ln_b: TensorId,
    pub projection: TensorId            // (projection_dim, hidden)
}

impl TextModel {
    pub fn tensor(&self, slot: TensorSlot) -> Option<TensorId> {
        match slot {
            TensorSlot::TokenEmbedding => Some(self.token_embeddings),
            TensorSlot::PositionEmbedding => Some(self.position_embeddings),
            TensorSlot::PostNormWeight => Some(self.post_ln_w),
            TensorSlot::PostNormBias => Some(self.post_ln_b),
            TensorSlot::Projection => Some(self.projection),
            TensorSlot::Layer(i, t) => self.layers.get(i).map(|l| l.tensor(t)),
            _ => None,
        }
    }
}

pub struct VisionModel {
    pub hparams: VisionHparams,
    pub class_embedding: TensorId,      // (hidden,)
    pub patch_embeddings: TensorId,     // (hidden, 3, patch, patch)
    pub position_embeddings: TensorId,  // (num_positions, hidden)
    pub pre_ln_w: TensorId,
    pub pre_ln_b: TensorId,
    pub layers: Vec<Layer>,
    pub post_ln_w: TensorId,
    pub post_ln_b: TensorId,
    pub projection: TensorId            // (projection_dim, hidden)
}

impl VisionModel {
    pub fn tensor(&self, slot: TensorSlot) -> Option<TensorId> {
        match slot {
            TensorSlot::ClassEmbedding => Some(self.class_embedding),
            TensorSlot::PatchEmbedding => Some(self.patch_embeddings),
            TensorSlot::PositionEmbedding => Some(self.position_embeddings),
            TensorSlot::PreNormWeight => Some(self.pre_ln_w),
            TensorSlot::PreNormBias => Some(self.pre_ln_b),
            TensorSlot::PostNormWeight => Some(self.post_ln_w),
            TensorSlot::PostNormBias => Some(self.post_ln_b),
            TensorSlot::Projection => Some(self.projection),
            TensorSlot::Layer(i, t) => self.layers.get(i).map(|l| l.tensor(t)),
            TensorSlot::TokenEmbedding => None,
        }
    }
}

/// A loaded checkpoint. Weights are immutable after load, so a context can be shared
/// by reference across threads; each forward pass brings its own `Scratch`.
pub struct ClipContext {
    pub text_model: TextModel,
    pub vision_model: VisionModel,
    pub tokenizer: Tokenizer,
    pub weight_type: WeightType,
    pub activation: Activation,
    pub arena: WeightArena
}

// -------------------------------------------------------------------------------------------------
// Tokenizer related structs
// Vocabulary entries are raw bytes: byte-level BPE tokens are not always valid UTF-8 on their own.
#[derive(Clone, Eq, PartialEq)]
pub struct TokenIndex {
    pub bytes: Vec<u8>,
    pub id: usize
}

pub struct Vocab {
    pub id_to_token: Vec<Vec<u8>>,
    pub sorted_vocab: Vec<TokenIndex>,   // byte-sorted for binary search
    pub special_tokens: Vec<String>,     // `<|...|>` entries, longest first
    pub start_id: usize,
    pub end_id: usize
}

pub struct Tokenizer {
    pub vocab: Vocab,
    pub pattern: Regex    // pre-tokenization grammar with the special tokens in front
}

/// A byte that no vocabulary entry covers; it is dropped from the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnknownPiece {
    pub offset: usize,  // byte offset into the input text
    pub byte: u8
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokenization {
    pub ids: Vec<usize>,
    pub unknown: Vec<UnknownPiece>
}

// -------------------------------------------------------------------------------------------------
// Images. Both layouts are row-major with interleaved channels: RGBRGB...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageU8 {
    pub nx: usize,
    pub ny: usize,
    pub data: Vec<u8>
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageF32 {
    pub nx: usize,
    pub ny: usize,
    pub data: Vec<f32>
}

// -------------------------------------------------------------------------------------------------
// Buffers for the activations of one forward pass. Owned by the caller and reused across
// calls; `&mut` access keeps two passes from ever sharing one.
#[derive(Default)]
pub struct Scratch {
    pub x: Vec<f32>,       // residual stream (n_pos, hidden)
    pub xb: Vec<f32>,      // normalized residual (n_pos, hidden)
    pub xb2: Vec<f32>,     // branch output before the residual add (n_pos, hidden)
    pub q: Vec<f32>,       // (n_pos, hidden)
    pub k: Vec<f32>,       // (n_pos, hidden)
    pub v: Vec<f32>,       // (n_pos, hidden)
    pub att: Vec<f32>,     // concatenated head outputs (n_pos, hidden)
    pub hb: Vec<f32>,      // ffn hidden (n_pos, n_intermediate)
    pub wbuf: Vec<f32>,    // one dequantized weight matrix
    pub pixels: Vec<f32>,  // planar image (3, image_size, image_size)
    pub pool: Option<(usize, Arc<rayon::ThreadPool>)>
}

/// Buffer sizes needed for one forward pass of a branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchLayout {
    pub n_pos: usize,
    pub hidden: usize,
    pub n_intermediate: usize,
    pub weight_elements: usize,
    pub pixels: usize
}

// struct used when sorting probabilities for ranking
#[derive(Default, Clone, Copy, PartialEq, PartialOrd)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    pub scores: Vec<f32>,    // softmax probabilities, descending
    pub indices: Vec<usize>  // original position of each score
}
