//! Temperature / top-p sampling over a logits vector. An external
//! collaborator like [`crate::tokenizer::BpeTokenizer`]: the forward-pass
//! pipeline only ever produces logits, never a sampled token.

use crate::tensor::softmax;
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig { temperature: 1.0, top_p: 1.0 }
    }
}

/// Greedy/temperature/nucleus sampler over a fixed vocabulary size.
pub struct Sampler {
    config: SamplerConfig,
    vocab_size: usize,
}

impl Sampler {
    pub fn new(vocab_size: usize, config: SamplerConfig) -> Self {
        Sampler { config, vocab_size }
    }

    /// Sample the next token id from `logits` (mutated in place: scaled by
    /// temperature and turned into a probability distribution unless
    /// `temperature == 0`, in which case it is read but not modified).
    pub fn sample(&self, logits: &mut [f32]) -> usize {
        debug_assert_eq!(logits.len(), self.vocab_size);

        if self.config.temperature == 0.0 {
            return argmax(logits);
        }

        let inv_temp = 1.0 / self.config.temperature;
        for logit in logits.iter_mut() {
            *logit *= inv_temp;
        }
        softmax(logits);

        let coin: f32 = rand::thread_rng().r#gen();
        if self.config.top_p <= 0.0 || self.config.top_p >= 1.0 {
            sample_mult(logits, coin)
        } else {
            sample_topp(logits, self.config.top_p, coin)
        }
    }
}

/// The index of the highest-probability entry (greedy decoding).
fn argmax(values: &[f32]) -> usize {
    let mut best_i = 0;
    let mut best_v = values[0];
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > best_v {
            best_i = i;
            best_v = v;
        }
    }
    best_i
}

/// Sample an index from a probability distribution (must sum to ~1) given
/// a uniform `coin` in `[0, 1)`.
fn sample_mult(probabilities: &[f32], coin: f32) -> usize {
    let mut cdf = 0.0;
    for (i, &p) in probabilities.iter().enumerate() {
        cdf += p;
        if coin < cdf {
            return i;
        }
    }
    probabilities.len() - 1
}

/// Top-p (nucleus) sampling: restrict to the smallest prefix of
/// descending-sorted probabilities whose cumulative mass exceeds `top_p`,
/// then sample from that renormalized subset.
fn sample_topp(probabilities: &[f32], top_p: f32, coin: f32) -> usize {
    let n = probabilities.len();
    // Indices whose probability is too small to ever matter can't be part
    // of the nucleus; pruning them before sorting keeps this cheap even
    // for a large vocabulary.
    let cutoff = (1.0 - top_p) / (n as f32 - 1.0);
    let mut candidates: Vec<(usize, f32)> =
        probabilities.iter().enumerate().filter(|&(_, &p)| p >= cutoff).map(|(i, &p)| (i, p)).collect();
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0;
    let mut last_idx = candidates.len() - 1;
    for (i, &(_, p)) in candidates.iter().enumerate() {
        cumulative += p;
        if cumulative > top_p {
            last_idx = i;
            break;
        }
    }

    let r = coin * cumulative;
    let mut cdf = 0.0;
    for &(idx, p) in &candidates[..=last_idx] {
        cdf += p;
        if r < cdf {
            return idx;
        }
    }
    candidates[last_idx].0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_temperature_is_deterministic_argmax() {
        let sampler = Sampler::new(4, SamplerConfig { temperature: 0.0, top_p: 1.0 });
        let mut logits = vec![0.1, 0.9, 0.2, -0.5];
        assert_eq!(sampler.sample(&mut logits), 1);
    }

    #[test]
    fn sample_mult_respects_cdf_boundaries() {
        let probs = [0.2, 0.3, 0.5];
        assert_eq!(sample_mult(&probs, 0.0), 0);
        assert_eq!(sample_mult(&probs, 0.19), 0);
        assert_eq!(sample_mult(&probs, 0.21), 1);
        assert_eq!(sample_mult(&probs, 0.99), 2);
    }

    #[test]
    fn sample_topp_never_returns_outside_vocab() {
        let probs = [0.6, 0.3, 0.05, 0.05];
        for coin in [0.0, 0.25, 0.5, 0.75, 0.999] {
            let idx = sample_topp(&probs, 0.9, coin);
            assert!(idx < probs.len());
        }
    }

    #[test]
    fn argmax_picks_strict_maximum() {
        assert_eq!(argmax(&[1.0, 5.0, 3.0]), 1);
    }
}
