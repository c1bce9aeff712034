//! Rotary position embeddings — rotates adjacent `(i, i+1)` pairs of a
//! query/key vector by an angle that grows with token position and shrinks
//! with pair index within the head.

/// Rotate `q` (and `k`, when present) in place for token position `pos`.
/// `dim` is the full (unsliced) query width, `kv_dim` is the key/value
/// width — `k` is only rotated for `i < kv_dim` since GQA shares fewer KV
/// heads than query heads.
pub fn apply_rope(q: &mut [f32], k: Option<&mut [f32]>, pos: usize, dim: usize, kv_dim: usize, head_size: usize, theta: f32) {
    debug_assert_eq!(q.len(), dim);
    let mut k = k;

    let mut i = 0;
    while i < dim {
        let head_dim = (i % head_size) as f32;
        let freq = 1.0 / theta.powf(head_dim / head_size as f32);
        let val = pos as f32 * freq;
        let fcr = val.cos();
        let fci = val.sin();

        let q0 = q[i];
        let q1 = q[i + 1];
        q[i] = q0 * fcr - q1 * fci;
        q[i + 1] = q0 * fci + q1 * fcr;

        if i < kv_dim {
            if let Some(k) = k.as_deref_mut() {
                let k0 = k[i];
                let k1 = k[i + 1];
                k[i] = k0 * fcr - k1 * fci;
                k[i + 1] = k0 * fci + k1 * fcr;
            }
        }
        i += 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_zero_is_identity() {
        let mut q = vec![1.0, 2.0, 3.0, 4.0];
        let original = q.clone();
        apply_rope(&mut q, None, 0, 4, 4, 4, 10000.0);
        for (a, b) in q.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn rotation_preserves_pair_norm() {
        let mut q = vec![1.0, 2.0, 3.0, 4.0];
        let norm_before = (q[0] * q[0] + q[1] * q[1]).sqrt();
        apply_rope(&mut q, None, 5, 4, 4, 4, 10000.0);
        let norm_after = (q[0] * q[0] + q[1] * q[1]).sqrt();
        assert!((norm_before - norm_after).abs() < 1e-4);
    }

    #[test]
    fn key_rotation_stops_at_kv_dim() {
        let mut q = vec![1.0, 1.0, 1.0, 1.0];
        let mut k = vec![1.0, 1.0];
        let original_k = k.clone();
        apply_rope(&mut q, Some(&mut k), 3, 4, 2, 4, 10000.0);
        assert_ne!(k, original_k);
    }
}
