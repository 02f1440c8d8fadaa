//! Image loading and the resize/normalize step that feeds the vision encoder.

use std::path::Path;

use rayon::prelude::*;
use tracing::debug;

use crate::core::config::{Letterbox, PreprocessOptions};
use crate::core::error::{ClipError, Result};
use crate::core::types::{ClipContext, ImageF32, ImageU8};

impl ImageU8 {
    pub fn new(nx: usize, ny: usize, data: Vec<u8>) -> Result<Self> {
        if data.len() != nx * ny * 3 {
            return Err(ClipError::InvalidInput(format!(
                "RGB buffer of {} bytes does not fit a {}x{} image",
                data.len(),
                nx,
                ny
            )));
        }
        Ok(ImageU8 { nx, ny, data })
    }

    /// Decode a JPEG, PNG or GIF file into RGB bytes.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let img = image::open(path.as_ref())?.to_rgb8();
        let (nx, ny) = img.dimensions();
        ImageU8::new(nx as usize, ny as usize, img.into_raw())
    }
}

/// Resize `img` to fit a square canvas of `opts.image_size` with bilinear sampling,
/// then normalize each channel with `opts.mean` / `opts.std`.
///
/// The longer side is scaled to the canvas. Canvas pixels not covered by the scaled
/// image hold the normalized value of a black pixel.
pub fn preprocess_image(img: &ImageU8, opts: &PreprocessOptions) -> Result<ImageF32> {
    let (nx, ny) = (img.nx, img.ny);
    if nx == 0 || ny == 0 {
        return Err(ClipError::InvalidInput("image has zero dimensions".to_string()));
    }
    if img.data.len() != nx * ny * 3 {
        return Err(ClipError::InvalidInput(format!(
            "RGB buffer of {} bytes does not fit a {}x{} image",
            img.data.len(),
            nx,
            ny
        )));
    }
    let size = opts.image_size;
    if size == 0 {
        return Err(ClipError::InvalidInput("target image size is zero".to_string()));
    }

    let scale = nx.max(ny) as f32 / size as f32;
    let nx3 = ((nx as f32 / scale + 0.5) as usize).clamp(1, size);
    let ny3 = ((ny as f32 / scale + 0.5) as usize).clamp(1, size);
    let (ox, oy) = match opts.letterbox {
        Letterbox::TopLeft => (0, 0),
        Letterbox::Center => ((size - nx3) / 2, (size - ny3) / 2),
    };
    debug!(scale, width = nx3, height = ny3, "preprocess");

    let black: [f32; 3] = std::array::from_fn(|c| (0.0 - opts.mean[c]) / opts.std[c]);
    let mut data = Vec::with_capacity(size * size * 3);
    for _ in 0..size * size {
        data.extend_from_slice(&black);
    }

    data.par_chunks_mut(size * 3)
        .enumerate()
        .skip(oy)
        .take(ny3)
        .for_each(|(row, out)| {
            let y = row - oy;
            let sy = (y as f32 + 0.5) * scale - 0.5;
            let y0 = (sy.floor().max(0.0) as usize).min(ny - 1);
            let y1 = (y0 + 1).min(ny - 1);
            let dy = sy - y0 as f32;

            for x in 0..nx3 {
                let sx = (x as f32 + 0.5) * scale - 0.5;
                let x0 = (sx.floor().max(0.0) as usize).min(nx - 1);
                let x1 = (x0 + 1).min(nx - 1);
                let dx = sx - x0 as f32;

                for c in 0..3 {
                    let v00 = img.data[3 * (y0 * nx + x0) + c] as f32;
                    let v01 = img.data[3 * (y0 * nx + x1) + c] as f32;
                    let v10 = img.data[3 * (y1 * nx + x0) + c] as f32;
                    let v11 = img.data[3 * (y1 * nx + x1) + c] as f32;

                    let v0 = v00 * (1.0 - dx) + v01 * dx;
                    let v1 = v10 * (1.0 - dx) + v11 * dx;
                    let v = (v0 * (1.0 - dy) + v1 * dy).round().clamp(0.0, 255.0);

                    out[3 * (ox + x) + c] = (v / 255.0 - opts.mean[c]) / opts.std[c];
                }
            }
        });

    Ok(ImageF32 { nx: size, ny: size, data })
}

/// Preprocess many images on a pool of `n_threads` workers.
pub fn preprocess_batch(
    images: &[ImageU8],
    opts: &PreprocessOptions,
    n_threads: usize,
) -> Result<Vec<ImageF32>> {
    let pool = rayon::ThreadPoolBuilder::new().num_threads(n_threads.max(1)).build()?;
    pool.install(|| images.par_iter().map(|img| preprocess_image(img, opts)).collect())
}

impl ClipContext {
    /// Preprocess for this model's input resolution with the standard CLIP statistics.
    pub fn preprocess(&self, img: &ImageU8) -> Result<ImageF32> {
        let size = self.vision_model.hparams.image_size as usize;
        let opts = PreprocessOptions::with_image_size(size);
        preprocess_image(img, &opts)
    }
}
