use chrono::Utc;
use rayon::prelude::*;
use tracing::debug;

use crate::core::config::Activation;
use crate::core::error::{ClipError, Result};
use crate::core::nnblocks::*;
use crate::core::tensor::{TensorId, WeightArena};
use crate::core::types::{ClipContext, ImageF32, Layer, Scratch, ScratchLayout};

// Shape of one transformer stack
#[derive(Debug, Clone, Copy)]
struct BlockDims {
    n_pos: usize,
    hidden: usize,
    n_head: usize,
    n_intermediate: usize,
    causal: bool,
}

// Decode a weight matrix into the scratch buffer and hand back just its elements.
fn weights<'a>(arena: &WeightArena, id: TensorId, wbuf: &'a mut [f32]) -> &'a [f32] {
    let n = arena.meta(id).n_elements();
    arena.dequantize(id, wbuf);
    &wbuf[..n]
}

fn block(
    arena: &WeightArena,
    layer: &Layer,
    s: &mut Scratch,
    d: BlockDims,
    activation: Activation,
) {
    let Scratch { x, xb, xb2, q, k, v, att, hb, wbuf, .. } = s;
    let (n, dim) = (d.n_pos, d.hidden);
    let head_size = dim / d.n_head;
    let rows = n * dim;
    let (x, xb, xb2) = (&mut x[..rows], &mut xb[..rows], &mut xb2[..rows]);
    let (q, k, v, att) = (&mut q[..rows], &mut k[..rows], &mut v[..rows], &mut att[..rows]);
    let hb = &mut hb[..n * d.n_intermediate];

    // Attention layer norm
    // X_b = layernorm(X)
    layer_norm_rows(xb, x, &arena.to_f32(layer.ln_1_w), &arena.to_f32(layer.ln_1_b), dim);

    // Q, K, V projections with bias
    linear(q, xb, weights(arena, layer.q_w, wbuf), Some(&arena.to_f32(layer.q_b)), dim, dim);
    linear(k, xb, weights(arena, layer.k_w, wbuf), Some(&arena.to_f32(layer.k_b)), dim, dim);
    linear(v, xb, weights(arena, layer.v_w, wbuf), Some(&arena.to_f32(layer.v_b)), dim, dim);
    scale_inplace(q, 1.0 / (head_size as f32).sqrt());

    // Multi-head attention, one task per query row
    // Attention = softmax(Q.K).V
    let (q, k, v) = (&*q, &*k, &*v);
    att.par_chunks_mut(dim)
        .enumerate()
        .for_each_init(
            || vec![0f32; n],
            |scores, (i, out)| {
                // causal: a query sees itself and the positions before it
                let n_keys = if d.causal { i + 1 } else { n };
                for h in 0..d.n_head {
                    let head = h * head_size..(h + 1) * head_size;
                    let q_i = &q[i * dim + head.start..i * dim + head.end];
                    for (t, score) in scores[..n_keys].iter_mut().enumerate() {
                        *score = dot(q_i, &k[t * dim + head.start..t * dim + head.end]);
                    }
                    softmax(&mut scores[..n_keys]);

                    let out = &mut out[head.clone()];
                    out.fill(0.0);
                    for (t, &a) in scores[..n_keys].iter().enumerate() {
                        let v_t = &v[t * dim + head.start..t * dim + head.end];
                        for (o, &vt) in out.iter_mut().zip(v_t) {
                            *o += a * vt;
                        }
                    }
                }
            },
        );

    // X_b2 = Att @ W_o + b_o
    linear(xb2, att, weights(arena, layer.o_w, wbuf), Some(&arena.to_f32(layer.o_b)), dim, dim);
    // X += X_b2
    add_inplace(x, xb2);

    // Feed forward network
    // X_b = layernorm(X)
    layer_norm_rows(xb, x, &arena.to_f32(layer.ln_2_w), &arena.to_f32(layer.ln_2_b), dim);
    // H = act(X_b @ W_1 + b_1)
    let fc1 = weights(arena, layer.ff_i_w, wbuf);
    linear(hb, xb, fc1, Some(&arena.to_f32(layer.ff_i_b)), dim, d.n_intermediate);
    activate(hb, activation);
    // X_b2 = H @ W_2 + b_2
    let fc2 = weights(arena, layer.ff_o_w, wbuf);
    linear(xb2, hb, fc2, Some(&arena.to_f32(layer.ff_o_b)), d.n_intermediate, dim);
    // X += X_b2
    add_inplace(x, xb2);
}

impl ClipContext {
    // Embed and run the text stack; leaves the final-normed rows in `s.xb`.
    fn text_forward(&self, s: &mut Scratch, ids: &[usize]) -> Result<()> {
        let model = &self.text_model;
        let hp = &model.hparams;
        let n = ids.len();
        if n == 0 {
            return Err(ClipError::InvalidInput("token sequence is empty".to_string()));
        }
        if n > hp.num_positions as usize {
            return Err(ClipError::InvalidInput(format!(
                "{} tokens exceed the {} text positions",
                n, hp.num_positions
            )));
        }
        if let Some(&id) = ids.iter().find(|&&id| id >= hp.n_vocab as usize) {
            return Err(ClipError::InvalidInput(format!(
                "token id {} is outside the vocabulary of {}",
                id, hp.n_vocab
            )));
        }
        s.ensure(&ScratchLayout::for_text(hp));

        let dim = hp.hidden();
        let rows = n * dim;
        // X = token_embedding[ids] + position_embedding[0..n]
        for (i, &id) in ids.iter().enumerate() {
            self.arena.dequantize_row_into(model.token_embeddings, id, &mut s.x[i * dim..]);
            self.arena.dequantize_row_into(model.position_embeddings, i, &mut s.xb[i * dim..]);
        }
        add_inplace(&mut s.x[..rows], &s.xb[..rows]);

        let dims = BlockDims {
            n_pos: n,
            hidden: dim,
            n_head: hp.n_head as usize,
            n_intermediate: hp.n_intermediate as usize,
            causal: true,
        };
        for layer in &model.layers {
            block(&self.arena, layer, s, dims, self.activation);
        }

        layer_norm_rows(
            &mut s.xb[..rows],
            &s.x[..rows],
            &self.arena.to_f32(model.post_ln_w),
            &self.arena.to_f32(model.post_ln_b),
            dim,
        );
        Ok(())
    }

    // Embed and run the vision stack; leaves the post-normed class row in `s.xb[..hidden]`.
    fn vision_forward(&self, s: &mut Scratch, img: &ImageF32) -> Result<()> {
        let model = &self.vision_model;
        let hp = &model.hparams;
        let size = hp.image_size as usize;
        if img.nx != size || img.ny != size || img.data.len() != 3 * size * size {
            return Err(ClipError::InvalidInput(format!(
                "image must be {}x{}x3, got {}x{} with {} values",
                size,
                size,
                img.nx,
                img.ny,
                img.data.len()
            )));
        }
        s.ensure(&ScratchLayout::for_vision(hp));

        let dim = hp.hidden();
        let n = hp.num_positions();
        let rows = n * dim;

        // interleaved RGB to planar (3, size, size)
        let plane = size * size;
        for (p, rgb) in img.data.chunks_exact(3).enumerate() {
            for (c, &val) in rgb.iter().enumerate() {
                s.pixels[c * plane + p] = val;
            }
        }

        // X = [class; patches] + position_embedding
        {
            let Scratch { x, pixels, wbuf, .. } = &mut *s;
            let w = weights(&self.arena, model.patch_embeddings, wbuf);
            let patch = hp.patch_size as usize;
            patch_embed(&mut x[dim..rows], &pixels[..3 * plane], w, 3, size, patch, dim);
        }
        self.arena.dequantize_row_into(model.class_embedding, 0, &mut s.x[..dim]);
        for i in 0..n {
            self.arena.dequantize_row_into(model.position_embeddings, i, &mut s.xb[i * dim..]);
        }
        add_inplace(&mut s.x[..rows], &s.xb[..rows]);

        // pre layer norm, result becomes the residual stream
        layer_norm_rows(
            &mut s.xb[..rows],
            &s.x[..rows],
            &self.arena.to_f32(model.pre_ln_w),
            &self.arena.to_f32(model.pre_ln_b),
            dim,
        );
        std::mem::swap(&mut s.x, &mut s.xb);

        let dims = BlockDims {
            n_pos: n,
            hidden: dim,
            n_head: hp.n_head as usize,
            n_intermediate: hp.n_intermediate as usize,
            causal: false,
        };
        for layer in &model.layers {
            block(&self.arena, layer, s, dims, self.activation);
        }

        layer_norm(
            &mut s.xb[..dim],
            &s.x[..dim],
            &self.arena.to_f32(model.post_ln_w),
            &self.arena.to_f32(model.post_ln_b),
        );
        Ok(())
    }

    // Project the pooled row `s.xb[row]` into the shared embedding space.
    fn project(
        &self,
        s: &mut Scratch,
        projection: TensorId,
        row: usize,
        hidden: usize,
        normalize: bool,
    ) -> Vec<f32> {
        let proj_dim = self.arena.meta(projection).extents[1];
        let mut out = vec![0f32; proj_dim];
        let Scratch { xb, wbuf, .. } = s;
        let w = weights(&self.arena, projection, wbuf);
        matmul(&mut out, &xb[row * hidden..(row + 1) * hidden], w, hidden, proj_dim);
        if normalize {
            l2_normalize(&mut out);
        }
        out
    }

    /// Final-normed hidden states of every text position, `ids.len()` rows of `hidden_size`.
    pub fn text_hidden_states(&self, ids: &[usize], n_threads: usize) -> Result<Vec<f32>> {
        let mut s = Scratch::for_text(&self.text_model);
        let pool = s.thread_pool(n_threads)?;
        pool.install(|| -> Result<Vec<f32>> {
            self.text_forward(&mut s, ids)?;
            Ok(s.xb[..ids.len() * self.text_model.hparams.hidden()].to_vec())
        })
    }

    pub fn encode_text(&self, ids: &[usize], n_threads: usize) -> Result<Vec<f32>> {
        let mut s = Scratch::for_text(&self.text_model);
        self.encode_text_with(&mut s, ids, n_threads, true)
    }

    /// Text embedding computed in a caller-owned scratch. With `normalize` false the raw
    /// projection is returned.
    pub fn encode_text_with(
        &self,
        s: &mut Scratch,
        ids: &[usize],
        n_threads: usize,
        normalize: bool,
    ) -> Result<Vec<f32>> {
        let start = Utc::now();
        let pool = s.thread_pool(n_threads)?;
        let embedding = pool.install(|| -> Result<Vec<f32>> {
            self.text_forward(s, ids)?;
            // the end-of-text token is the last position
            let hidden = self.text_model.hparams.hidden();
            Ok(self.project(s, self.text_model.projection, ids.len() - 1, hidden, normalize))
        })?;
        debug!(n_tokens = ids.len(), ms = (Utc::now() - start).num_milliseconds(), "text encoded");
        Ok(embedding)
    }

    pub fn encode_image(&self, img: &ImageF32, n_threads: usize) -> Result<Vec<f32>> {
        let mut s = Scratch::for_vision(&self.vision_model);
        self.encode_image_with(&mut s, img, n_threads, true)
    }

    pub fn encode_image_with(
        &self,
        s: &mut Scratch,
        img: &ImageF32,
        n_threads: usize,
        normalize: bool,
    ) -> Result<Vec<f32>> {
        let start = Utc::now();
        let pool = s.thread_pool(n_threads)?;
        let embedding = pool.install(|| self.image_embedding(s, img, normalize))?;
        debug!(ms = (Utc::now() - start).num_milliseconds(), "image encoded");
        Ok(embedding)
    }

    fn image_embedding(
        &self,
        s: &mut Scratch,
        img: &ImageF32,
        normalize: bool,
    ) -> Result<Vec<f32>> {
        self.vision_forward(s, img)?;
        let hidden = self.vision_model.hparams.hidden();
        Ok(self.project(s, self.vision_model.projection, 0, hidden, normalize))
    }

    /// Normalized embeddings of many images, in input order. Images are spread over the
    /// workers, each with its own scratch.
    pub fn encode_image_batch(
        &self,
        images: &[ImageF32],
        n_threads: usize,
    ) -> Result<Vec<Vec<f32>>> {
        if n_threads == 0 {
            return Err(ClipError::InvalidInput("n_threads must be at least 1".to_string()));
        }
        let start = Utc::now();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(n_threads).build()?;
        let embeddings = pool.install(|| {
            images.par_iter()
                .map_init(
                    || Scratch::for_vision(&self.vision_model),
                    |s, img| self.image_embedding(s, img, true),
                )
                .collect::<Result<Vec<_>>>()
        })?;
        debug!(
            n_images = images.len(),
            ms = (Utc::now() - start).num_milliseconds(),
            "image batch encoded"
        );
        Ok(embeddings)
    }
}
