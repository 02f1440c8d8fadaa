//! Weight storage: element types, tensor metadata and the arena that owns every weight byte.
//!
//! Tensors keep the on-disk (ggml) extent order: extent 0 is the contiguous row length,
//! extent 1 the number of rows, and so on. Raw bytes are stored verbatim and decoded to
//! f32 on demand by the forward passes.

use half::f16;
use rayon::prelude::*;

use crate::core::error::{ClipError, Result};

/// Elements per 4-bit block.
pub const QK4: usize = 32;
/// 4-bit tensors must have rows that are a multiple of this width.
pub const Q4_MIN_ROW: usize = 64;
/// Every tensor starts on this byte boundary inside the arena.
pub const TENSOR_ALIGN: usize = 32;

pub type TensorId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightType {
    F32,
    F16,
    /// blocks of 32: f16 scale, 16 bytes of nibbles, value = (q - 8) * d
    Q4_0,
    /// blocks of 32: f16 scale, f16 min, 16 bytes of nibbles, value = q * d + m
    Q4_1,
}

impl WeightType {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(WeightType::F32),
            1 => Ok(WeightType::F16),
            2 => Ok(WeightType::Q4_0),
            3 => Ok(WeightType::Q4_1),
            other => Err(ClipError::UnsupportedWeightType(other)),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            WeightType::F32 => 0,
            WeightType::F16 => 1,
            WeightType::Q4_0 => 2,
            WeightType::Q4_1 => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WeightType::F32 => "f32",
            WeightType::F16 => "f16",
            WeightType::Q4_0 => "q4_0",
            WeightType::Q4_1 => "q4_1",
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, WeightType::Q4_0 | WeightType::Q4_1)
    }

    pub fn block_size(self) -> usize {
        if self.is_quantized() {
            QK4
        } else {
            1
        }
    }

    pub fn block_bytes(self) -> usize {
        match self {
            WeightType::F32 => 4,
            WeightType::F16 => 2,
            WeightType::Q4_0 => 2 + QK4 / 2,
            WeightType::Q4_1 => 2 + 2 + QK4 / 2,
        }
    }

    /// Storage bytes for `n_elements` values, rounding partial blocks up.
    pub fn size_of(self, n_elements: usize) -> usize {
        n_elements.div_ceil(self.block_size()) * self.block_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct TensorMeta {
    pub name: String,
    pub weight_type: WeightType,
    pub n_dims: usize,
    pub extents: [usize; 4],
    pub offset: usize,
    pub n_bytes: usize,
}

impl TensorMeta {
    pub fn n_elements(&self) -> usize {
        self.extents.iter().product()
    }

    pub fn row_len(&self) -> usize {
        self.extents[0]
    }

    pub fn row_bytes(&self) -> usize {
        self.weight_type.size_of(self.row_len())
    }
}

/// One contiguous allocation holding every weight of a checkpoint.
///
/// The capacity is reserved up front from a bound computed over the hyperparameters;
/// declaring past that bound fails instead of reallocating, so offsets stay stable.
pub struct WeightArena {
    data: Vec<u8>,
    capacity: usize,
    tensors: Vec<TensorMeta>,
}

impl WeightArena {
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| ClipError::AllocationFailure {
                requested: capacity,
                available: 0,
            })?;
        Ok(WeightArena {
            data,
            capacity,
            tensors: Vec::new(),
        })
    }

    pub fn declare(
        &mut self,
        name: String,
        weight_type: WeightType,
        extents: &[usize],
    ) -> Result<TensorId> {
        if extents.is_empty() || extents.len() > 4 {
            return Err(ClipError::InvalidHyperparameters(format!(
                "tensor '{}' declared with {} dimensions",
                name,
                extents.len()
            )));
        }
        if weight_type.is_quantized() && extents[0] % Q4_MIN_ROW != 0 {
            return Err(ClipError::InvalidHyperparameters(format!(
                "tensor '{}' has rows of {} elements, {} needs a multiple of {}",
                name,
                extents[0],
                weight_type.name(),
                Q4_MIN_ROW
            )));
        }

        let mut ne = [1usize; 4];
        ne[..extents.len()].copy_from_slice(extents);
        let n_bytes = ne.iter()
            .try_fold(1usize, |n, &e| n.checked_mul(e))
            .and_then(|n| {
                n.div_ceil(weight_type.block_size()).checked_mul(weight_type.block_bytes())
            })
            .unwrap_or(usize::MAX);

        let offset = self.data.len().next_multiple_of(TENSOR_ALIGN);
        let end = offset.checked_add(n_bytes).filter(|&end| end <= self.capacity);
        let Some(end) = end else {
            return Err(ClipError::AllocationFailure {
                requested: n_bytes,
                available: self.capacity.saturating_sub(offset),
            });
        };
        // capacity was reserved, so this never moves the buffer
        self.data.resize(end, 0);

        self.tensors.push(TensorMeta {
            name,
            weight_type,
            n_dims: extents.len(),
            extents: ne,
            offset,
            n_bytes,
        });
        Ok(self.tensors.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn meta(&self, id: TensorId) -> &TensorMeta {
        &self.tensors[id]
    }

    pub fn bytes(&self, id: TensorId) -> &[u8] {
        let meta = &self.tensors[id];
        &self.data[meta.offset..meta.offset + meta.n_bytes]
    }

    pub fn bytes_mut(&mut self, id: TensorId) -> &mut [u8] {
        let (offset, n_bytes) = {
            let meta = &self.tensors[id];
            (meta.offset, meta.n_bytes)
        };
        &mut self.data[offset..offset + n_bytes]
    }

    /// Decode a whole tensor into `out[..n_elements]`, rows in parallel.
    pub fn dequantize(&self, id: TensorId, out: &mut [f32]) {
        let meta = &self.tensors[id];
        let row_len = meta.row_len();
        let row_bytes = meta.row_bytes();
        let out = &mut out[..meta.n_elements()];
        out.par_chunks_mut(row_len)
            .zip(self.bytes(id).par_chunks(row_bytes))
            .for_each(|(dst, src)| dequantize_row(meta.weight_type, src, dst));
    }

    /// Decode row `row` (a slice of extent 0) into `out[..row_len]`.
    pub fn dequantize_row_into(&self, id: TensorId, row: usize, out: &mut [f32]) {
        let meta = &self.tensors[id];
        let row_bytes = meta.row_bytes();
        let start = row * row_bytes;
        let src = &self.bytes(id)[start..start + row_bytes];
        dequantize_row(meta.weight_type, src, &mut out[..meta.row_len()]);
    }

    pub fn to_f32(&self, id: TensorId) -> Vec<f32> {
        let mut out = vec![0f32; self.tensors[id].n_elements()];
        self.dequantize(id, &mut out);
        out
    }
}

/// Decode one contiguous run of `dst.len()` elements.
pub fn dequantize_row(weight_type: WeightType, src: &[u8], dst: &mut [f32]) {
    match weight_type {
        WeightType::F32 => {
            for (d, s) in dst.iter_mut().zip(src.chunks_exact(4)) {
                *d = f32::from_le_bytes([s[0], s[1], s[2], s[3]]);
            }
        }
        WeightType::F16 => {
            for (d, s) in dst.iter_mut().zip(src.chunks_exact(2)) {
                *d = f16::from_le_bytes([s[0], s[1]]).to_f32();
            }
        }
        WeightType::Q4_0 => {
            for (d, block) in dst.chunks_mut(QK4).zip(src.chunks_exact(weight_type.block_bytes())) {
                let scale = f16::from_le_bytes([block[0], block[1]]).to_f32();
                let quants = &block[2..];
                for (j, &byte) in quants.iter().enumerate() {
                    d[j] = scale * ((byte & 0x0F) as i16 - 8) as f32;
                    d[j + QK4 / 2] = scale * ((byte >> 4) as i16 - 8) as f32;
                }
            }
        }
        WeightType::Q4_1 => {
            for (d, block) in dst.chunks_mut(QK4).zip(src.chunks_exact(weight_type.block_bytes())) {
                let scale = f16::from_le_bytes([block[0], block[1]]).to_f32();
                let min = f16::from_le_bytes([block[2], block[3]]).to_f32();
                let quants = &block[4..];
                for (j, &byte) in quants.iter().enumerate() {
                    d[j] = scale * f32::from(byte & 0x0F) + min;
                    d[j + QK4 / 2] = scale * f32::from(byte >> 4) + min;
                }
            }
        }
    }
}
