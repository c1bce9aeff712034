//! Multi-head causal attention with grouped-query sharing: `n_kv_heads`
//! can be smaller than `n_heads`, in which case `kv_mul = n_heads /
//! n_kv_heads` query heads share the same key/value head.

use crate::kv_cache::KvCache;
use crate::tensor::softmax;

/// Run attention for every query head at `pos`, writing `head_size`-wide
/// outputs contiguously into `output` (length `n_heads * head_size`).
///
/// `q` holds `n_heads * head_size` query values for the current token.
pub fn multi_head_attention(
    output: &mut [f32],
    q: &[f32],
    cache: &KvCache,
    layer: usize,
    pos: usize,
    n_heads: usize,
    n_kv_heads: usize,
    head_size: usize,
) {
    let kv_mul = n_heads / n_kv_heads;
    let scale = 1.0 / (head_size as f32).sqrt();

    for h in 0..n_heads {
        let q_head = &q[h * head_size..(h + 1) * head_size];
        let kv_head_offset = (h / kv_mul) * head_size;

        let mut scores = vec![0.0f32; pos + 1];
        for t in 0..=pos {
            let k = cache.key_head(layer, t, kv_head_offset, head_size);
            let dot: f32 = q_head.iter().zip(k.iter()).map(|(&a, &b)| a * b).sum();
            scores[t] = dot * scale;
        }
        softmax(&mut scores);

        let out_head = &mut output[h * head_size..(h + 1) * head_size];
        out_head.fill(0.0);
        for t in 0..=pos {
            let v = cache.value_head(layer, t, kv_head_offset, head_size);
            let weight = scores[t];
            for i in 0..head_size {
                out_head[i] += weight * v[i];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_timestep_returns_the_value_vector() {
        let mut cache = KvCache::new(1, 4, 4);
        cache.key_at_mut(0, 0).copy_from_slice(&[1.0, 0.0, 0.0, 0.0]);
        cache.value_at_mut(0, 0).copy_from_slice(&[0.0, 1.0, 0.0, 0.0]);

        let q = vec![1.0, 0.0, 0.0, 0.0];
        let mut output = vec![0.0; 4];
        multi_head_attention(&mut output, &q, &cache, 0, 0, 1, 1, 4);

        assert!((output[0] - 0.0).abs() < 1e-5);
        assert!((output[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn grouped_query_heads_share_the_same_kv_head() {
        let mut cache = KvCache::new(1, 2, 4);
        cache.key_at_mut(0, 0).copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        cache.value_at_mut(0, 0).copy_from_slice(&[5.0, 5.0, 5.0, 5.0]);

        // 2 query heads, 1 kv head: both query heads should draw from the
        // same key/value head and produce identical output.
        let q = vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let mut output = vec![0.0; 8];
        multi_head_attention(&mut output, &q, &cache, 0, 0, 2, 1, 4);

        assert_eq!(&output[0..4], &output[4..8]);
    }
}
