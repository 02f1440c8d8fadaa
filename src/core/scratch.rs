use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::core::error::{ClipError, Result};
use crate::core::types::{
    ClipContext, Scratch, ScratchLayout, TextHparams, TextModel, VisionHparams, VisionModel,
};

impl ScratchLayout {
    fn weight_elements(hidden: usize, n_inter: usize, projection_dim: usize) -> usize {
        (hidden * hidden).max(hidden * n_inter).max(hidden * projection_dim)
    }

    pub fn for_text(hparams: &TextHparams) -> Self {
        let hidden = hparams.hidden();
        let n_inter = hparams.n_intermediate as usize;
        let proj = hparams.projection_dim as usize;
        ScratchLayout {
            n_pos: hparams.num_positions as usize,
            hidden,
            n_intermediate: n_inter,
            weight_elements: Self::weight_elements(hidden, n_inter, proj),
            pixels: 0,
        }
    }

    pub fn for_vision(hparams: &VisionHparams) -> Self {
        let hidden = hparams.hidden();
        let n_inter = hparams.n_intermediate as usize;
        let patch = hparams.patch_size as usize;
        let image = hparams.image_size as usize;
        ScratchLayout {
            n_pos: hparams.num_positions(),
            hidden,
            n_intermediate: n_inter,
            weight_elements: Self::weight_elements(hidden, n_inter, hparams.projection_dim as usize)
                .max(hidden * 3 * patch * patch),
            pixels: 3 * image * image,
        }
    }

    /// Field-wise maximum, enough for a pass described by either layout.
    pub fn max(self, other: ScratchLayout) -> ScratchLayout {
        ScratchLayout {
            n_pos: self.n_pos.max(other.n_pos),
            hidden: self.hidden.max(other.hidden),
            n_intermediate: self.n_intermediate.max(other.n_intermediate),
            weight_elements: self.weight_elements.max(other.weight_elements),
            pixels: self.pixels.max(other.pixels),
        }
    }
}

// grow to exactly `len`, never shrink
fn grow(buf: &mut Vec<f32>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0.0);
    }
}

impl Scratch {
    /// Buffers for the forward passes of both branches of `ctx`.
    pub fn new(ctx: &ClipContext) -> Self {
        let text = ScratchLayout::for_text(ctx.text_hparams());
        Self::with_layout(&text.max(ScratchLayout::for_vision(ctx.vision_hparams())))
    }

    pub fn for_text(model: &TextModel) -> Self {
        Self::with_layout(&ScratchLayout::for_text(&model.hparams))
    }

    pub fn for_vision(model: &VisionModel) -> Self {
        Self::with_layout(&ScratchLayout::for_vision(&model.hparams))
    }

    pub fn with_layout(layout: &ScratchLayout) -> Self {
        let mut scratch = Scratch::default();
        scratch.ensure(layout);
        scratch
    }

    pub fn ensure(&mut self, layout: &ScratchLayout) {
        let rows = layout.n_pos * layout.hidden;
        for buf in [
            &mut self.x,
            &mut self.xb,
            &mut self.xb2,
            &mut self.q,
            &mut self.k,
            &mut self.v,
            &mut self.att,
        ] {
            grow(buf, rows);
        }
        grow(&mut self.hb, layout.n_pos * layout.n_intermediate);
        grow(&mut self.wbuf, layout.weight_elements);
        grow(&mut self.pixels, layout.pixels);
    }

    /// Pool with `n_threads` workers, built on first use and rebuilt when the count changes.
    pub fn thread_pool(&mut self, n_threads: usize) -> Result<Arc<ThreadPool>> {
        if n_threads == 0 {
            return Err(ClipError::InvalidInput("n_threads must be at least 1".to_string()));
        }
        if let Some((n, pool)) = &self.pool {
            if *n == n_threads {
                return Ok(Arc::clone(pool));
            }
        }
        debug!(n_threads, "building thread pool");
        let pool = Arc::new(ThreadPoolBuilder::new().num_threads(n_threads).build()?);
        self.pool = Some((n_threads, Arc::clone(&pool)));
        Ok(pool)
    }
}
