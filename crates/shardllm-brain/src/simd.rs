//! Runtime-dispatched SIMD dot product for the F32 matmul path.
//!
//! AVX2 and NEON accelerators, falling back to the scalar reference in
//! [`crate::tensor::dot_product`] on any other target or when the feature
//! isn't available at runtime. The scalar path always agrees bit-for-bit
//! with the reference; the accelerated paths agree within float
//! reassociation error, same as the reference implementation's own
//! `#if defined(__ARM_NEON)` / `#elif defined(__AVX2__)` split.

/// Accelerated dot product, dispatching to SIMD when available on this CPU.
pub fn dot_product_simd(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            // SAFETY: avx2 feature checked above.
            return unsafe { avx2::dot_product(a, b) };
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: NEON is mandatory on aarch64, no runtime check needed.
        return unsafe { neon::dot_product(a, b) };
    }

    #[allow(unreachable_code)]
    crate::tensor::dot_product(a, b)
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    #[target_feature(enable = "avx2")]
    pub unsafe fn dot_product(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let lanes = n - n % 8;
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < lanes {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
            i += 8;
        }
        let mut buf = [0.0f32; 8];
        _mm256_storeu_ps(buf.as_mut_ptr(), acc);
        let mut sum: f32 = buf.iter().sum();
        while i < n {
            sum += a[i] * b[i];
            i += 1;
        }
        sum
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    #[target_feature(enable = "neon")]
    pub unsafe fn dot_product(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let lanes = n - n % 4;
        let mut acc = vdupq_n_f32(0.0);
        let mut i = 0;
        while i < lanes {
            let va = vld1q_f32(a.as_ptr().add(i));
            let vb = vld1q_f32(b.as_ptr().add(i));
            acc = vfmaq_f32(acc, va, vb);
            i += 4;
        }
        let mut sum = vaddvq_f32(acc);
        while i < n {
            sum += a[i] * b[i];
            i += 1;
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_scalar_reference() {
        let a: Vec<f32> = (0..37).map(|i| i as f32 * 0.1).collect();
        let b: Vec<f32> = (0..37).map(|i| (i as f32 * 0.3).sin()).collect();
        let scalar = crate::tensor::dot_product(&a, &b);
        let simd = dot_product_simd(&a, &b);
        assert!((scalar - simd).abs() < 1e-3, "scalar={scalar} simd={simd}");
    }

    #[test]
    fn handles_length_not_a_multiple_of_lane_width() {
        let a = vec![1.0f32; 5];
        let b = vec![2.0f32; 5];
        assert!((dot_product_simd(&a, &b) - 10.0).abs() < 1e-6);
    }
}
