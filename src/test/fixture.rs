// Tiny synthetic checkpoints for the loader and encoder tests.

use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use half::f16;
use tempfile::NamedTempFile;

use crate::core::checkpoint::GGML_MAGIC;
use crate::core::config::LoadOptions;
use crate::core::error::{ClipError, Result};
use crate::core::tensor::{WeightType, QK4};
use crate::core::types::{ClipContext, TextHparams, VisionHparams};

pub const VOCAB: [&str; 16] = [
    "a", "b", "c", "h", "e", "l", "o", " ", "!", "a</w>", "hello</w>", "he", "ll", "'s</w>",
    "<|startoftext|>", "<|endoftext|>",
];

pub fn vocab_id(token: &str) -> usize {
    VOCAB.iter().position(|t| *t == token).unwrap()
}

pub struct Record {
    pub name: String,
    pub ftype: i32,
    pub extents: Vec<usize>,
    pub data: Vec<u8>,
}

pub struct Fixture {
    pub text: TextHparams,
    pub vision: VisionHparams,
    pub ftype: i32,
    pub vocab: Vec<Vec<u8>>,
    pub records: Vec<Record>,
}

// Deterministic weights, all multiples of 1/256 in [-0.25, 0.25] so f16 stores them exactly.
struct Weights(u64);

impl Weights {
    fn next(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let k = ((self.0 >> 33) % 129) as i32 - 64;
        k as f32 / 256.0
    }

    fn next_byte(&mut self) -> u8 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 56) as u8
    }
}

fn encode(wtype: WeightType, n: usize, rng: &mut Weights, norm_weight: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(wtype.size_of(n));
    match wtype {
        WeightType::F32 => {
            for _ in 0..n {
                let v = if norm_weight { 1.0 + rng.next() } else { rng.next() };
                out.write_f32::<LittleEndian>(v).unwrap();
            }
        }
        WeightType::F16 => {
            for _ in 0..n {
                out.extend_from_slice(&f16::from_f32(rng.next()).to_le_bytes());
            }
        }
        WeightType::Q4_0 | WeightType::Q4_1 => {
            for _ in 0..n / QK4 {
                out.extend_from_slice(&f16::from_f32(1.0 / 64.0).to_le_bytes());
                if wtype == WeightType::Q4_1 {
                    out.extend_from_slice(&f16::from_f32(-0.125).to_le_bytes());
                }
                for _ in 0..QK4 / 2 {
                    out.push(rng.next_byte());
                }
            }
        }
    }
    out
}

impl Fixture {
    /// 16-token vocab, 8-wide single-layer text and vision stacks on 4x4 images.
    pub fn new(wtype: WeightType) -> Self {
        Self::with_dims(wtype, 8, 16)
    }

    pub fn with_dims(wtype: WeightType, hidden: i32, n_intermediate: i32) -> Self {
        let text = TextHparams {
            n_vocab: VOCAB.len() as i32,
            num_positions: 8,
            hidden_size: hidden,
            n_intermediate,
            projection_dim: 8,
            n_head: 2,
            n_layer: 1,
        };
        let vision = VisionHparams {
            image_size: 4,
            patch_size: 2,
            hidden_size: hidden,
            n_intermediate,
            projection_dim: 8,
            n_head: 2,
            n_layer: 1,
        };
        let mut fixture = Fixture {
            text,
            vision,
            ftype: wtype.code(),
            vocab: VOCAB.iter().map(|t| t.as_bytes().to_vec()).collect(),
            records: Vec::new(),
        };
        fixture.records = fixture.generate_records(wtype);
        fixture
    }

    fn generate_records(&self, wtype: WeightType) -> Vec<Record> {
        let f32s = WeightType::F32;
        let patch_type = if wtype.is_quantized() { WeightType::F16 } else { wtype };
        let (h, i) = (self.text.hidden_size as usize, self.text.n_intermediate as usize);
        let proj = self.text.projection_dim as usize;
        let p = self.vision.patch_size as usize;
        let grid = (self.vision.image_size / self.vision.patch_size) as usize;

        let layer = |prefix: &str| -> Vec<(String, WeightType, Vec<usize>)> {
            let mut v = Vec::new();
            for m in ["q", "k", "v", "out"] {
                v.push((format!("{prefix}encoder.layers.0.self_attn.{m}_proj.weight"), wtype, vec![h, h]));
                v.push((format!("{prefix}encoder.layers.0.self_attn.{m}_proj.bias"), f32s, vec![h]));
            }
            for n in ["layer_norm1", "layer_norm2"] {
                v.push((format!("{prefix}encoder.layers.0.{n}.weight"), f32s, vec![h]));
                v.push((format!("{prefix}encoder.layers.0.{n}.bias"), f32s, vec![h]));
            }
            v.push((format!("{prefix}encoder.layers.0.mlp.fc1.weight"), wtype, vec![h, i]));
            v.push((format!("{prefix}encoder.layers.0.mlp.fc1.bias"), f32s, vec![i]));
            v.push((format!("{prefix}encoder.layers.0.mlp.fc2.weight"), wtype, vec![i, h]));
            v.push((format!("{prefix}encoder.layers.0.mlp.fc2.bias"), f32s, vec![h]));
            v
        };

        let mut tensors = vec![
            ("text_model.embeddings.token_embedding.weight".to_string(), wtype, vec![h, VOCAB.len()]),
            ("text_model.embeddings.position_embedding.weight".to_string(), wtype, vec![h, 8]),
        ];
        tensors.extend(layer("text_model."));
        tensors.extend([
            ("text_model.final_layer_norm.weight".to_string(), f32s, vec![h]),
            ("text_model.final_layer_norm.bias".to_string(), f32s, vec![h]),
            ("text_projection.weight".to_string(), wtype, vec![h, proj]),
            ("vision_model.embeddings.class_embedding".to_string(), f32s, vec![h]),
            ("vision_model.embeddings.patch_embedding.weight".to_string(), patch_type, vec![p, p, 3, h]),
            ("vision_model.embeddings.position_embedding.weight".to_string(), wtype, vec![h, grid * grid + 1]),
            ("vision_model.pre_layrnorm.weight".to_string(), f32s, vec![h]),
            ("vision_model.pre_layrnorm.bias".to_string(), f32s, vec![h]),
        ]);
        tensors.extend(layer("vision_model."));
        tensors.extend([
            ("vision_model.post_layernorm.weight".to_string(), f32s, vec![h]),
            ("vision_model.post_layernorm.bias".to_string(), f32s, vec![h]),
            ("visual_projection.weight".to_string(), wtype, vec![h, proj]),
        ]);

        let mut rng = Weights(0x5eed);
        tensors.into_iter()
            .map(|(name, t, extents)| {
                let norm_weight = name.contains("norm") && name.ends_with(".weight");
                let data = encode(t, extents.iter().product(), &mut rng, norm_weight);
                Record { name, ftype: t.code(), extents, data }
            })
            .collect()
    }

    pub fn record_mut(&mut self, name: &str) -> &mut Record {
        self.records.iter_mut().find(|r| r.name == name).unwrap()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(GGML_MAGIC).unwrap();
        let t = &self.text;
        let v = &self.vision;
        for x in [t.n_vocab, t.num_positions, t.hidden_size, t.n_intermediate, t.projection_dim, t.n_head, t.n_layer] {
            out.write_i32::<LittleEndian>(x).unwrap();
        }
        for x in [v.image_size, v.patch_size, v.hidden_size, v.n_intermediate, v.projection_dim, v.n_head, v.n_layer] {
            out.write_i32::<LittleEndian>(x).unwrap();
        }
        out.write_i32::<LittleEndian>(self.ftype).unwrap();

        out.write_i32::<LittleEndian>(self.vocab.len() as i32).unwrap();
        for token in &self.vocab {
            out.write_u32::<LittleEndian>(token.len() as u32).unwrap();
            out.extend_from_slice(token);
        }

        for r in &self.records {
            out.write_i32::<LittleEndian>(r.extents.len() as i32).unwrap();
            out.write_i32::<LittleEndian>(r.name.len() as i32).unwrap();
            out.write_i32::<LittleEndian>(r.ftype).unwrap();
            for &e in &r.extents {
                out.write_i32::<LittleEndian>(e as i32).unwrap();
            }
            out.extend_from_slice(r.name.as_bytes());
            out.extend_from_slice(&r.data);
        }
        out
    }

    pub fn load(&self) -> Result<ClipContext> {
        let opts = LoadOptions { verbosity: 0, ..Default::default() };
        ClipContext::from_bytes(&self.to_bytes(), &opts)
    }

    pub fn write(&self) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&self.to_bytes()).unwrap();
        file.flush().unwrap();
        file
    }
}

/// The error of a load that must fail.
pub fn load_err(bytes: &[u8]) -> ClipError {
    let opts = LoadOptions { verbosity: 0, ..Default::default() };
    match ClipContext::from_bytes(bytes, &opts) {
        Ok(_) => panic!("load unexpectedly succeeded"),
        Err(e) => e,
    }
}
