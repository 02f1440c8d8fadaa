use std::fs::File;
use std::io::{Cursor, ErrorKind, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::Utc;
use memmap2::Mmap;
use tracing::{debug, info, warn};

use crate::core::config::LoadOptions;
use crate::core::error::{ClipError, Result};
use crate::core::names::{self, Branch, LayerTensor, TensorSlot};
use crate::core::tensor::{TensorId, WeightArena, WeightType, Q4_MIN_ROW, TENSOR_ALIGN};
use crate::core::types::{
    ClipContext, Layer, TextHparams, TextModel, Tokenizer, VisionHparams, VisionModel, Vocab,
};

pub const GGML_MAGIC: u32 = 0x6767_6d6c;

// slack per declared tensor on top of its storage, covers alignment padding
const OBJECT_OVERHEAD: usize = 256;

// -------------------------------------------------------------------------------------------------
// Header

fn header_err(e: std::io::Error, what: &str) -> ClipError {
    if e.kind() == ErrorKind::UnexpectedEof {
        ClipError::InvalidFormat(format!("file ends inside the {what}"))
    } else {
        ClipError::Io(e)
    }
}

fn read_i32s<const N: usize>(cur: &mut Cursor<&[u8]>, what: &str) -> Result<[i32; N]> {
    let mut out = [0i32; N];
    cur.read_i32_into::<LittleEndian>(&mut out).map_err(|e| header_err(e, what))?;
    Ok(out)
}

fn read_text_hparams(cur: &mut Cursor<&[u8]>) -> Result<TextHparams> {
    let [n_vocab, num_positions, hidden_size, n_intermediate, projection_dim, n_head, n_layer] =
        read_i32s::<7>(cur, "text hyperparameters")?;
    Ok(TextHparams {
        n_vocab,
        num_positions,
        hidden_size,
        n_intermediate,
        projection_dim,
        n_head,
        n_layer,
    })
}

fn read_vision_hparams(cur: &mut Cursor<&[u8]>) -> Result<VisionHparams> {
    let [image_size, patch_size, hidden_size, n_intermediate, projection_dim, n_head, n_layer] =
        read_i32s::<7>(cur, "vision hyperparameters")?;
    Ok(VisionHparams {
        image_size,
        patch_size,
        hidden_size,
        n_intermediate,
        projection_dim,
        n_head,
        n_layer,
    })
}

fn validate_hparams(text: &TextHparams, vision: &VisionHparams) -> Result<()> {
    let fields = [
        ("text n_vocab", text.n_vocab),
        ("text num_positions", text.num_positions),
        ("text hidden_size", text.hidden_size),
        ("text n_intermediate", text.n_intermediate),
        ("text projection_dim", text.projection_dim),
        ("text n_head", text.n_head),
        ("text n_layer", text.n_layer),
        ("vision image_size", vision.image_size),
        ("vision patch_size", vision.patch_size),
        ("vision hidden_size", vision.hidden_size),
        ("vision n_intermediate", vision.n_intermediate),
        ("vision projection_dim", vision.projection_dim),
        ("vision n_head", vision.n_head),
        ("vision n_layer", vision.n_layer),
    ];
    if let Some((field, value)) = fields.iter().find(|(_, v)| *v <= 0) {
        return Err(ClipError::InvalidHyperparameters(format!(
            "{field} must be positive, got {value}"
        )));
    }
    if text.hidden_size % text.n_head != 0 {
        return Err(ClipError::InvalidHyperparameters(format!(
            "text hidden_size {} is not divisible by n_head {}",
            text.hidden_size, text.n_head
        )));
    }
    if vision.hidden_size % vision.n_head != 0 {
        return Err(ClipError::InvalidHyperparameters(format!(
            "vision hidden_size {} is not divisible by n_head {}",
            vision.hidden_size, vision.n_head
        )));
    }
    if vision.image_size % vision.patch_size != 0 {
        return Err(ClipError::InvalidHyperparameters(format!(
            "image_size {} is not divisible by patch_size {}",
            vision.image_size, vision.patch_size
        )));
    }
    if text.projection_dim != vision.projection_dim {
        warn!(
            text = text.projection_dim,
            vision = vision.projection_dim,
            "projection dims differ, text and image embeddings are not comparable"
        );
    }
    Ok(())
}

fn remaining(cur: &Cursor<&[u8]>) -> usize {
    cur.get_ref().len().saturating_sub(cur.position() as usize)
}

fn read_vocab(cur: &mut Cursor<&[u8]>, text: &TextHparams) -> Result<Vocab> {
    let [count] = read_i32s::<1>(cur, "vocabulary")?;
    if count != text.n_vocab {
        return Err(ClipError::VocabSizeMismatch { declared: count, expected: text.n_vocab });
    }
    // every entry takes at least its 4-byte length
    let mut tokens = Vec::with_capacity((count as usize).min(remaining(cur) / 4));
    for _ in 0..count {
        let len = cur.read_u32::<LittleEndian>().map_err(|e| header_err(e, "vocabulary"))? as usize;
        if len > remaining(cur) {
            return Err(ClipError::InvalidFormat("file ends inside the vocabulary".to_string()));
        }
        let mut token = vec![0u8; len];
        cur.read_exact(&mut token).map_err(|e| header_err(e, "vocabulary"))?;
        tokens.push(token);
    }
    Ok(Vocab::from_tokens(tokens))
}

// -------------------------------------------------------------------------------------------------
// Tensor declaration

// 4-bit kernels are not used for the convolution weights
fn patch_type(wtype: WeightType) -> WeightType {
    if wtype.is_quantized() {
        WeightType::F16
    } else {
        wtype
    }
}

fn overflow() -> ClipError {
    ClipError::InvalidHyperparameters("tensor sizes overflow the address space".to_string())
}

// Running byte total over declared tensors; overflow is an error.
#[derive(Default)]
struct ByteCount(usize);

impl ByteCount {
    fn add(&mut self, copies: usize, wtype: WeightType, extents: &[usize]) -> Result<()> {
        let bytes = extents.iter()
            .try_fold(1usize, |n, &e| n.checked_mul(e))
            .and_then(|n| n.div_ceil(wtype.block_size()).checked_mul(wtype.block_bytes()))
            .and_then(|b| b.checked_mul(copies))
            .ok_or_else(overflow)?;
        self.0 = self.0.checked_add(bytes).ok_or_else(overflow)?;
        Ok(())
    }

    fn add_layers(
        &mut self,
        n_layer: usize,
        hidden: usize,
        n_inter: usize,
        wtype: WeightType,
    ) -> Result<()> {
        let f32s = WeightType::F32;
        self.add(n_layer.checked_mul(4).ok_or_else(overflow)?, wtype, &[hidden, hidden])?;
        self.add(n_layer, wtype, &[hidden, n_inter])?;
        self.add(n_layer, wtype, &[n_inter, hidden])?;
        // biases and norms
        self.add(n_layer, f32s, &[hidden, 8])?;
        self.add(n_layer, f32s, &[n_inter])
    }

    // per-tensor overhead for a branch with `n_layer` layers
    fn add_objects(&mut self, n_layer: usize) -> Result<()> {
        let n_objects = n_layer.checked_mul(16)
            .and_then(|n| n.checked_add(10))
            .ok_or_else(overflow)?;
        let bytes = n_objects.checked_mul(OBJECT_OVERHEAD).ok_or_else(overflow)?;
        self.0 = self.0.checked_add(bytes).ok_or_else(overflow)?;
        Ok(())
    }
}

/// Upper bound on the arena bytes needed for every tensor of both branches.
pub fn arena_bound(text: &TextHparams, vision: &VisionHparams, wtype: WeightType) -> Result<usize> {
    let f32s = WeightType::F32;
    let mut total = ByteCount::default();

    let (th, ti, tl) = (text.hidden(), text.n_intermediate as usize, text.n_layer as usize);
    total.add(1, wtype, &[th, text.n_vocab as usize])?;
    total.add(1, wtype, &[th, text.num_positions as usize])?;
    total.add_layers(tl, th, ti, wtype)?;
    total.add(2, f32s, &[th])?;
    total.add(1, wtype, &[th, text.projection_dim as usize])?;
    total.add_objects(tl)?;

    let (vh, vi, vl) = (vision.hidden(), vision.n_intermediate as usize, vision.n_layer as usize);
    let patch = vision.patch_size as usize;
    total.add(1, f32s, &[vh])?;
    total.add(1, patch_type(wtype), &[patch, patch, 3, vh])?;
    total.add(1, wtype, &[vh, vision.num_positions()])?;
    total.add(4, f32s, &[vh])?;
    total.add_layers(vl, vh, vi, wtype)?;
    total.add(1, wtype, &[vh, vision.projection_dim as usize])?;
    total.add_objects(vl)?;

    total.0.checked_add(TENSOR_ALIGN).ok_or_else(overflow)
}

fn declare(
    arena: &mut WeightArena,
    branch: Branch,
    slot: TensorSlot,
    wtype: WeightType,
    extents: &[usize],
) -> Result<TensorId> {
    let name = slot.name(branch).ok_or_else(|| {
        ClipError::InvalidFormat(format!("{slot:?} has no name in the {branch:?} branch"))
    })?;
    arena.declare(name, wtype, extents)
}

fn declare_layer(
    arena: &mut WeightArena,
    branch: Branch,
    index: usize,
    hidden: usize,
    n_inter: usize,
    wtype: WeightType,
) -> Result<Layer> {
    let f32s = WeightType::F32;
    let mut decl = |t: LayerTensor, wtype: WeightType, extents: &[usize]| {
        declare(arena, branch, TensorSlot::Layer(index, t), wtype, extents)
    };
    Ok(Layer {
        q_w: decl(LayerTensor::QueryWeight, wtype, &[hidden, hidden])?,
        q_b: decl(LayerTensor::QueryBias, f32s, &[hidden])?,
        k_w: decl(LayerTensor::KeyWeight, wtype, &[hidden, hidden])?,
        k_b: decl(LayerTensor::KeyBias, f32s, &[hidden])?,
        v_w: decl(LayerTensor::ValueWeight, wtype, &[hidden, hidden])?,
        v_b: decl(LayerTensor::ValueBias, f32s, &[hidden])?,
        o_w: decl(LayerTensor::OutWeight, wtype, &[hidden, hidden])?,
        o_b: decl(LayerTensor::OutBias, f32s, &[hidden])?,
        ln_1_w: decl(LayerTensor::Norm1Weight, f32s, &[hidden])?,
        ln_1_b: decl(LayerTensor::Norm1Bias, f32s, &[hidden])?,
        ff_i_w: decl(LayerTensor::Fc1Weight, wtype, &[hidden, n_inter])?,
        ff_i_b: decl(LayerTensor::Fc1Bias, f32s, &[n_inter])?,
        ff_o_w: decl(LayerTensor::Fc2Weight, wtype, &[n_inter, hidden])?,
        ff_o_b: decl(LayerTensor::Fc2Bias, f32s, &[hidden])?,
        ln_2_w: decl(LayerTensor::Norm2Weight, f32s, &[hidden])?,
        ln_2_b: decl(LayerTensor::Norm2Bias, f32s, &[hidden])?,
    })
}

fn declare_text(
    arena: &mut WeightArena,
    hparams: TextHparams,
    wtype: WeightType,
) -> Result<TextModel> {
    let b = Branch::Text;
    let hidden = hparams.hidden();
    let (n_vocab, n_pos) = (hparams.n_vocab as usize, hparams.num_positions as usize);
    let token_embeddings =
        declare(arena, b, TensorSlot::TokenEmbedding, wtype, &[hidden, n_vocab])?;
    let position_embeddings =
        declare(arena, b, TensorSlot::PositionEmbedding, wtype, &[hidden, n_pos])?;
    let layers = (0..hparams.n_layer as usize)
        .map(|i| declare_layer(arena, b, i, hidden, hparams.n_intermediate as usize, wtype))
        .collect::<Result<Vec<_>>>()?;
    let post_ln_w = declare(arena, b, TensorSlot::PostNormWeight, WeightType::F32, &[hidden])?;
    let post_ln_b = declare(arena, b, TensorSlot::PostNormBias, WeightType::F32, &[hidden])?;
    let proj = hparams.projection_dim as usize;
    let projection = declare(arena, b, TensorSlot::Projection, wtype, &[hidden, proj])?;
    Ok(TextModel {
        hparams,
        token_embeddings,
        position_embeddings,
        layers,
        post_ln_w,
        post_ln_b,
        projection,
    })
}

fn declare_vision(
    arena: &mut WeightArena,
    hparams: VisionHparams,
    wtype: WeightType,
) -> Result<VisionModel> {
    let b = Branch::Vision;
    let hidden = hparams.hidden();
    let patch = hparams.patch_size as usize;
    let n_pos = hparams.num_positions();
    let class_embedding =
        declare(arena, b, TensorSlot::ClassEmbedding, WeightType::F32, &[hidden])?;
    let kernel = [patch, patch, 3, hidden];
    let patch_embeddings =
        declare(arena, b, TensorSlot::PatchEmbedding, patch_type(wtype), &kernel)?;
    let position_embeddings =
        declare(arena, b, TensorSlot::PositionEmbedding, wtype, &[hidden, n_pos])?;
    let pre_ln_w = declare(arena, b, TensorSlot::PreNormWeight, WeightType::F32, &[hidden])?;
    let pre_ln_b = declare(arena, b, TensorSlot::PreNormBias, WeightType::F32, &[hidden])?;
    let layers = (0..hparams.n_layer as usize)
        .map(|i| declare_layer(arena, b, i, hidden, hparams.n_intermediate as usize, wtype))
        .collect::<Result<Vec<_>>>()?;
    let post_ln_w = declare(arena, b, TensorSlot::PostNormWeight, WeightType::F32, &[hidden])?;
    let post_ln_b = declare(arena, b, TensorSlot::PostNormBias, WeightType::F32, &[hidden])?;
    let proj = hparams.projection_dim as usize;
    let projection = declare(arena, b, TensorSlot::Projection, wtype, &[hidden, proj])?;
    Ok(VisionModel {
        hparams,
        class_embedding,
        patch_embeddings,
        position_embeddings,
        pre_ln_w,
        pre_ln_b,
        layers,
        post_ln_w,
        post_ln_b,
        projection,
    })
}

// -------------------------------------------------------------------------------------------------
// Tensor records

fn record_i32(cur: &mut Cursor<&[u8]>, name: &str) -> Result<i32> {
    cur.read_i32::<LittleEndian>().map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            ClipError::SizeMismatch { name: name.to_string(), expected: 4, got: 0 }
        } else {
            ClipError::Io(e)
        }
    })
}

fn non_negative(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| ClipError::InvalidFormat(format!("negative {what} {value} in tensor record")))
}

fn load_tensors(
    cur: &mut Cursor<&[u8]>,
    arena: &mut WeightArena,
    text: &TextModel,
    vision: &VisionModel,
    verbosity: u8,
) -> Result<usize> {
    let data: &[u8] = *cur.get_ref();
    let mut loaded = vec![false; arena.len()];
    let mut total_size = 0usize;

    while (cur.position() as usize) < data.len() {
        let n_dims = non_negative(record_i32(cur, "<record header>")?, "dimension count")?;
        let name_len = non_negative(record_i32(cur, "<record header>")?, "name length")?;
        let ftype = record_i32(cur, "<record header>")?;
        if n_dims == 0 || n_dims > 4 {
            return Err(ClipError::InvalidFormat(format!("tensor record with {n_dims} dimensions")));
        }

        let mut ne = [1usize; 4];
        for extent in ne.iter_mut().take(n_dims) {
            *extent = non_negative(record_i32(cur, "<record header>")?, "extent")?;
        }

        let start = cur.position() as usize;
        if data.len() - start < name_len {
            return Err(ClipError::SizeMismatch {
                name: "<record name>".to_string(),
                expected: name_len,
                got: data.len() - start,
            });
        }
        let name = String::from_utf8_lossy(&data[start..start + name_len]).into_owned();
        cur.set_position((start + name_len) as u64);

        let ftype = WeightType::from_code(ftype)?;
        let id = names::parse(&name)
            .and_then(|(branch, slot)| match branch {
                Branch::Text => text.tensor(slot),
                Branch::Vision => vision.tensor(slot),
            })
            .ok_or_else(|| ClipError::UnknownTensor(name.clone()))?;
        if loaded[id] {
            return Err(ClipError::DuplicateTensor(name));
        }

        let meta = arena.meta(id);
        let n_elements = ne.iter().try_fold(1usize, |n, &e| n.checked_mul(e));
        let Some(n_elements) = n_elements.filter(|&n| n == meta.n_elements()) else {
            return Err(ClipError::ShapeMismatch { name, expected: meta.extents, got: ne });
        };
        if ne[0] != meta.extents[0] || ne[1] != meta.extents[1] {
            return Err(ClipError::ShapeMismatch { name, expected: meta.extents, got: ne });
        }
        if ftype.is_quantized() && ne[0] % Q4_MIN_ROW != 0 {
            return Err(ClipError::SizeMismatch {
                name,
                expected: meta.n_bytes,
                got: ftype.size_of(n_elements),
            });
        }
        let n_bytes = ftype.size_of(n_elements);
        if n_bytes != meta.n_bytes {
            return Err(ClipError::SizeMismatch { name, expected: meta.n_bytes, got: n_bytes });
        }

        let start = cur.position() as usize;
        let available = data.len() - start;
        if available < n_bytes {
            return Err(ClipError::SizeMismatch { name, expected: n_bytes, got: available });
        }
        if verbosity >= 2 {
            debug!(
                name = %name,
                extents = ?&ne[..n_dims],
                weight_type = ftype.name(),
                mb = n_bytes as f64 / 1024.0 / 1024.0,
                "tensor"
            );
        }
        arena.bytes_mut(id).copy_from_slice(&data[start..start + n_bytes]);
        cur.set_position((start + n_bytes) as u64);

        loaded[id] = true;
        total_size += n_bytes;
    }

    if let Some(missing) = loaded.iter().position(|seen| !seen) {
        return Err(ClipError::MissingTensor(arena.meta(missing).name.clone()));
    }
    Ok(total_size)
}

// -------------------------------------------------------------------------------------------------

impl ClipContext {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with(path, &LoadOptions::default())
    }

    pub fn load_with<P: AsRef<Path>>(path: P, opts: &LoadOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and dropped before returning; weights are copied out
        let mmap = unsafe { Mmap::map(&file)? };
        if opts.verbosity >= 1 {
            info!(path = %path.display(), bytes = mmap.len(), "loading model");
        }
        Self::from_bytes(&mmap, opts)
    }

    /// Parse a whole checkpoint held in memory.
    pub fn from_bytes(data: &[u8], opts: &LoadOptions) -> Result<Self> {
        let start = Utc::now();
        let mut cur = Cursor::new(data);

        let magic = cur.read_u32::<LittleEndian>().map_err(|e| header_err(e, "magic"))?;
        if magic != GGML_MAGIC {
            return Err(ClipError::InvalidFormat(format!("bad magic {magic:#010x}")));
        }

        let text_hparams = read_text_hparams(&mut cur)?;
        let vision_hparams = read_vision_hparams(&mut cur)?;
        let [ftype] = read_i32s::<1>(&mut cur, "weight type")?;
        let weight_type = WeightType::from_code(ftype)?;
        validate_hparams(&text_hparams, &vision_hparams)?;
        if opts.verbosity >= 1 {
            info!(?text_hparams, "text model");
            info!(?vision_hparams, weight_type = weight_type.name(), "vision model");
        }

        let vocab = read_vocab(&mut cur, &text_hparams)?;
        let tokenizer = Tokenizer::new(vocab)?;

        let capacity = arena_bound(&text_hparams, &vision_hparams, weight_type)?;
        if opts.verbosity >= 1 {
            info!(mb = capacity as f64 / 1024.0 / 1024.0, "weight arena");
        }
        let mut arena = WeightArena::with_capacity(capacity)?;
        let text_model = declare_text(&mut arena, text_hparams, weight_type)?;
        let vision_model = declare_vision(&mut arena, vision_hparams, weight_type)?;

        let total_size =
            load_tensors(&mut cur, &mut arena, &text_model, &vision_model, opts.verbosity)?;
        if opts.verbosity >= 1 {
            let elapsed = Utc::now() - start;
            info!(
                tensors = arena.len(),
                mb = total_size as f64 / 1024.0 / 1024.0,
                ms = elapsed.num_milliseconds(),
                "model loaded"
            );
        }

        Ok(ClipContext {
            text_model,
            vision_model,
            tokenizer,
            weight_type,
            activation: opts.activation,
            arena,
        })
    }

    pub fn text_hparams(&self) -> &TextHparams {
        &self.text_model.hparams
    }

    pub fn vision_hparams(&self) -> &VisionHparams {
        &self.vision_model.hparams
    }
}
