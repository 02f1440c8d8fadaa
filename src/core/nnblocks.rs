use rayon::prelude::*;

use crate::core::config::Activation;

pub const LAYER_NORM_EPS: f32 = 1e-5;

pub fn layer_norm(o: &mut [f32], x: &[f32], weight: &[f32], bias: &[f32]) {
    assert_eq!(o.len(), x.len(), "o and x must have the same length");
    assert_eq!(o.len(), weight.len(), "o and weight must have the same length");
    assert_eq!(o.len(), bias.len(), "o and bias must have the same length");

    let size = x.len() as f32;

    let mean = x.iter().sum::<f32>() / size;
    let variance = x.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / size;
    let scale = 1.0 / (variance + LAYER_NORM_EPS).sqrt();

    o.iter_mut()
        .zip(x.iter())
        .zip(weight.iter().zip(bias.iter()))
        .for_each(|((o, &x), (&w, &b))| {
            *o = (x - mean) * scale * w + b;
        });
}

// Row-wise layer norm over (rows, dim) matrices
pub fn layer_norm_rows(o: &mut [f32], x: &[f32], weight: &[f32], bias: &[f32], dim: usize) {
    assert_eq!(o.len(), x.len(), "o and x must have the same length");
    o.par_chunks_mut(dim)
        .zip(x.par_chunks(dim))
        .for_each(|(o, x)| layer_norm(o, x, weight, bias));
}

pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }

    // Find max value (for numerical stability)
    let max_val = x.iter().fold(x[0], |max, &val| max.max(val));

    // Exp and sum
    let sum: f32 = x.iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum();

    // Normalize
    x.iter_mut().for_each(|val| *val /= sum);
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(&a, &b)| a * b).sum()
}

// Matrix-vector multiplication using parallel execution
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32], n: usize, d: usize) {
    assert_eq!(xout.len(), d, "xout must have length d");
    assert_eq!(x.len(), n, "x must have length n");
    assert_eq!(w.len(), d * n, "w must have length d * n");
    xout.par_iter_mut()
        .enumerate()
        .for_each(|(i, val)| {
            *val = dot(&w[i * n..(i + 1) * n], x);
        });
}

// Y = X @ W^T + b for X (rows, n) and W (d, n), parallel over rows of X
pub fn linear(y: &mut [f32], x: &[f32], w: &[f32], bias: Option<&[f32]>, n: usize, d: usize) {
    assert_eq!(x.len() % n, 0, "x must hold whole rows of length n");
    assert_eq!(y.len(), x.len() / n * d, "y must have rows of length d");
    assert_eq!(w.len(), d * n, "w must have length d * n");
    if let Some(b) = bias {
        assert_eq!(b.len(), d, "bias must have length d");
    }
    y.par_chunks_mut(d)
        .zip(x.par_chunks(n))
        .for_each(|(y, x)| {
            for (i, val) in y.iter_mut().enumerate() {
                *val = dot(&w[i * n..(i + 1) * n], x) + bias.map_or(0.0, |b| b[i]);
            }
        });
}

pub fn add_inplace(x: &mut [f32], y: &[f32]) {
    assert_eq!(x.len(), y.len(), "x and y must have the same length");
    x.par_iter_mut()
        .zip(y.par_iter())
        .for_each(|(x, &y)| *x += y);
}

pub fn scale_inplace(x: &mut [f32], s: f32) {
    x.par_iter_mut().for_each(|v| *v *= s);
}

// x * sigmoid(1.702 * x)
pub fn gelu_quick(x: f32) -> f32 {
    x / (1.0 + (-1.702 * x).exp())
}

// tanh approximation
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * x * (1.0 + 0.044_715 * x * x)).tanh())
}

pub fn activate(x: &mut [f32], activation: Activation) {
    match activation {
        Activation::QuickGelu => x.par_iter_mut().for_each(|v| *v = gelu_quick(*v)),
        Activation::Gelu => x.par_iter_mut().for_each(|v| *v = gelu(*v)),
    }
}

/// Divide by the Euclidean norm. An all-zero vector is left untouched.
pub fn l2_normalize(x: &mut [f32]) {
    let norm = dot(x, x).sqrt();
    if norm > 0.0 {
        x.iter_mut().for_each(|v| *v /= norm);
    }
}

// Strided convolution with kernel = stride = patch and no padding or bias.
// pixels: planar (channels, size, size); w: (hidden, channels, patch, patch);
// out: (grid * grid, hidden) with patches in row-major grid order.
pub fn patch_embed(
    out: &mut [f32], pixels: &[f32], w: &[f32],
    channels: usize, size: usize, patch: usize, hidden: usize) {
    let grid = size / patch;
    let kernel = channels * patch * patch;
    assert_eq!(pixels.len(), channels * size * size, "pixels must be (channels, size, size)");
    assert_eq!(w.len(), hidden * kernel, "w must be (hidden, channels, patch, patch)");
    assert_eq!(out.len(), grid * grid * hidden, "out must be (grid * grid, hidden)");

    out.par_chunks_mut(hidden)
        .enumerate()
        .for_each_init(
            || vec![0f32; kernel],
            |window, (p, out)| {
                let (py, px) = (p / grid, p % grid);
                // gather the patch in (channel, ky, kx) order to match the kernel layout
                for c in 0..channels {
                    for ky in 0..patch {
                        let src = c * size * size + (py * patch + ky) * size + px * patch;
                        let dst = (c * patch + ky) * patch;
                        window[dst..dst + patch].copy_from_slice(&pixels[src..src + patch]);
                    }
                }
                for (o, val) in out.iter_mut().enumerate() {
                    *val = dot(&w[o * kernel..(o + 1) * kernel], window);
                }
            },
        );
}
