use std::cmp::Ordering;

use tracing::debug;

use crate::core::error::{ClipError, Result};
use crate::core::nnblocks::{dot, softmax};
use crate::core::types::{ClipContext, ImageU8, ProbIndex, Ranking, Scratch};

/// Cosine similarity of two unit vectors, clamped to [0, 1].
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "embeddings must have the same length");
    dot(a, b).clamp(0.0, 1.0)
}

pub fn try_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(ClipError::InvalidInput(format!(
            "embedding lengths differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(similarity(a, b))
}

/// Softmax over `scores`, sorted by descending probability. Equal probabilities keep
/// their input order.
pub fn rank(scores: &[f32]) -> Ranking {
    let mut probs = scores.to_vec();
    softmax(&mut probs);

    let mut prob_index: Vec<ProbIndex> = probs.iter()
        .enumerate()
        .map(|(index, &prob)| ProbIndex { prob, index })
        .collect();
    // sort_by is stable
    prob_index.sort_by(|a, b| b.prob.partial_cmp(&a.prob).unwrap_or(Ordering::Equal));

    Ranking {
        scores: prob_index.iter().map(|p| p.prob).collect(),
        indices: prob_index.iter().map(|p| p.index).collect(),
    }
}

impl ClipContext {
    /// Similarity between a text and a raw image.
    pub fn compare_text_and_image(
        &self,
        text: &str,
        img: &ImageU8,
        n_threads: usize,
    ) -> Result<f32> {
        let mut s = Scratch::new(self);
        let ids = self.tokenize(text);
        let text_vec = self.encode_text_with(&mut s, &ids, n_threads, true)?;
        let pixels = self.preprocess(img)?;
        let image_vec = self.encode_image_with(&mut s, &pixels, n_threads, true)?;
        try_similarity(&text_vec, &image_vec)
    }

    /// Probability of each label describing `img`, most likely first. The softmax runs over
    /// the plain similarities.
    pub fn zero_shot<S: AsRef<str>>(
        &self,
        img: &ImageU8,
        labels: &[S],
        n_threads: usize,
    ) -> Result<Vec<(String, f32)>> {
        let mut s = Scratch::new(self);
        let pixels = self.preprocess(img)?;
        let image_vec = self.encode_image_with(&mut s, &pixels, n_threads, true)?;

        let mut scores = Vec::with_capacity(labels.len());
        for label in labels {
            let ids = self.tokenize(label.as_ref());
            let text_vec = self.encode_text_with(&mut s, &ids, n_threads, true)?;
            scores.push(try_similarity(&text_vec, &image_vec)?);
        }
        debug!(n_labels = labels.len(), "zero-shot similarities computed");

        let ranking = rank(&scores);
        Ok(ranking.indices.iter()
            .zip(ranking.scores.iter())
            .map(|(&i, &p)| (labels[i].as_ref().to_string(), p))
            .collect())
    }
}
