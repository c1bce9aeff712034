//! Matrix-vector multiplication kernels, dispatched on the
//! `(weight dtype, activation dtype)` pair.
//!
//! Only four pairs are supported: `(F32,F32)`, `(F16,F32)`, `(Q4_0,F32)` and
//! `(Q4_0,Q8_0)`. Everything else is a configuration error the loader should
//! have caught earlier, but `matmul` still returns `UnsupportedDType` rather
//! than panicking so a caller that skipped validation fails cleanly.

use crate::quant::{thread_block_range, BLOCK_SIZE, Q4_0_BLOCK_BYTES, Q8_0_BLOCK_BYTES};
use crate::spec::FloatType;
use shardllm_core::error::{Result, ShardLlmError};

/// `output[ds..de] = weights[ds..de, :] @ input`, where `weights` is `d`
/// rows of `n` columns in row-major order and `[ds, de)` is this thread's
/// partition of the `d` output rows.
pub fn matmul(
    weight_kind: FloatType,
    act_kind: FloatType,
    output: &mut [f32],
    input: &[u8],
    weights: &[u8],
    n: usize,
    d: usize,
    n_threads: usize,
    thread_index: usize,
) -> Result<()> {
    let (ds, de) = thread_block_range(d, n_threads, thread_index);
    match (weight_kind, act_kind) {
        (FloatType::F32, FloatType::F32) => {
            matmul_f32(output, input, weights, n, ds, de);
            Ok(())
        }
        (FloatType::F16, FloatType::F32) => {
            matmul_f16(output, input, weights, n, ds, de);
            Ok(())
        }
        (FloatType::Q4_0, FloatType::F32) => {
            matmul_q4_0_f32(output, input, weights, n, ds, de);
            Ok(())
        }
        (FloatType::Q4_0, FloatType::Q8_0) => {
            matmul_q4_0_q8_0(output, input, weights, n, ds, de);
            Ok(())
        }
        (w, a) => Err(ShardLlmError::UnsupportedDType {
            weight_kind: format!("{w:?}"),
            activation_kind: format!("{a:?}"),
        }),
    }
}

fn read_f32(bytes: &[u8], i: usize) -> f32 {
    let o = i * 4;
    f32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]])
}

fn read_f16(bytes: &[u8], i: usize) -> f32 {
    let o = i * 2;
    half::f16::from_le_bytes([bytes[o], bytes[o + 1]]).to_f32()
}

fn matmul_f32(output: &mut [f32], input: &[u8], weights: &[u8], n: usize, ds: usize, de: usize) {
    // The activation row is already dense f32 bytes; decode it once up
    // front so the SIMD dot product can run over native slices instead of
    // re-parsing bytes per element.
    let input: Vec<f32> = (0..n).map(|j| read_f32(input, j)).collect();
    let mut row_buf = vec![0.0f32; n];
    for row in ds..de {
        let row_off = row * n * 4;
        for (j, slot) in row_buf.iter_mut().enumerate() {
            *slot = read_f32(&weights[row_off..], j);
        }
        output[row] = crate::simd::dot_product_simd(&row_buf, &input);
    }
}

fn matmul_f16(output: &mut [f32], input: &[u8], weights: &[u8], n: usize, ds: usize, de: usize) {
    for row in ds..de {
        let mut val = 0.0f32;
        let row_off = row * n * 2;
        for j in 0..n {
            val += read_f16(&weights[row_off..], j) * read_f32(input, j);
        }
        output[row] = val;
    }
}

/// Dequantize one Q4_0 row's worth of weights on the fly and dot it against
/// an F32 activation vector.
fn matmul_q4_0_f32(output: &mut [f32], input: &[u8], weights: &[u8], n: usize, ds: usize, de: usize) {
    debug_assert_eq!(n % BLOCK_SIZE, 0);
    let blocks_per_row = n / BLOCK_SIZE;
    let row_bytes = blocks_per_row * Q4_0_BLOCK_BYTES;
    let mut group = [0.0f32; BLOCK_SIZE];

    for row in ds..de {
        let row_off = row * row_bytes;
        let mut val = 0.0f32;
        for b in 0..blocks_per_row {
            let block = &weights[row_off + b * Q4_0_BLOCK_BYTES..row_off + (b + 1) * Q4_0_BLOCK_BYTES];
            crate::quant::dequantize_block_q4_0(block, &mut group);
            for z in 0..BLOCK_SIZE {
                val += group[z] * read_f32(input, b * BLOCK_SIZE + z);
            }
        }
        output[row] = val;
    }
}

/// Integer-domain dot product between a Q4_0 weight row and a Q8_0
/// activation row: per block, sum the signed products of the (recentered)
/// nibbles against the Q8_0 bytes, then scale by `d_weight * d_activation`.
fn matmul_q4_0_q8_0(output: &mut [f32], input: &[u8], weights: &[u8], n: usize, ds: usize, de: usize) {
    debug_assert_eq!(n % BLOCK_SIZE, 0);
    let blocks_per_row = n / BLOCK_SIZE;
    let row_bytes = blocks_per_row * Q4_0_BLOCK_BYTES;

    for row in ds..de {
        let row_off = row * row_bytes;
        let mut val = 0.0f32;
        for b in 0..blocks_per_row {
            let wblock = &weights[row_off + b * Q4_0_BLOCK_BYTES..row_off + (b + 1) * Q4_0_BLOCK_BYTES];
            let ablock = &input[b * Q8_0_BLOCK_BYTES..(b + 1) * Q8_0_BLOCK_BYTES];

            let wd = half::f16::from_le_bytes([wblock[0], wblock[1]]).to_f32();
            let ad = half::f16::from_le_bytes([ablock[0], ablock[1]]).to_f32();

            let mut isum: i32 = 0;
            for i in 0..16 {
                let byte = wblock[2 + i];
                let lo = (byte & 0x0F) as i32 - 8;
                let hi = ((byte >> 4) & 0x0F) as i32 - 8;
                let a_lo = ablock[2 + i] as i8 as i32;
                let a_hi = ablock[2 + 16 + i] as i8 as i32;
                isum += lo * a_lo + hi * a_hi;
            }
            val += isum as f32 * wd * ad;
        }
        output[row] = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::{quantize_block_q4_0, quantize_block_q8_0};

    fn f32_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    #[test]
    fn f32_matmul_matches_reference() {
        let mat = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let vec_in = vec![1.0f32, 1.0, 1.0];
        let weights = f32_bytes(&mat);
        let input = f32_bytes(&vec_in);
        let mut output = vec![0.0f32; 2];
        matmul(FloatType::F32, FloatType::F32, &mut output, &input, &weights, 3, 2, 1, 0).unwrap();
        assert!((output[0] - 6.0).abs() < 1e-6);
        assert!((output[1] - 15.0).abs() < 1e-6);
    }

    #[test]
    fn q4_0_f32_is_close_to_dense_reference() {
        let n = 32;
        let d = 2;
        let mut row0 = vec![0.0f32; n];
        let mut row1 = vec![0.0f32; n];
        for i in 0..n {
            row0[i] = (i as f32 - 16.0) * 0.3;
            row1[i] = (i as f32 % 5.0) - 2.0;
        }
        let vec_in: Vec<f32> = (0..n).map(|i| (i as f32 * 0.1).sin()).collect();

        let mut wbytes = vec![0u8; d * Q4_0_BLOCK_BYTES];
        quantize_block_q4_0(&row0, &mut wbytes[0..Q4_0_BLOCK_BYTES]);
        quantize_block_q4_0(&row1, &mut wbytes[Q4_0_BLOCK_BYTES..]);
        let input = f32_bytes(&vec_in);

        let mut output = vec![0.0f32; d];
        matmul(FloatType::Q4_0, FloatType::F32, &mut output, &input, &wbytes, n, d, 1, 0).unwrap();

        let reference0: f32 = row0.iter().zip(vec_in.iter()).map(|(a, b)| a * b).sum();
        let reference1: f32 = row1.iter().zip(vec_in.iter()).map(|(a, b)| a * b).sum();
        assert!((output[0] - reference0).abs() < 1.0, "got {} want {}", output[0], reference0);
        assert!((output[1] - reference1).abs() < 1.0, "got {} want {}", output[1], reference1);
    }

    #[test]
    fn q4_0_q8_0_matches_q4_0_f32_within_quant_noise() {
        let n = 32;
        let d = 1;
        let row: Vec<f32> = (0..n).map(|i| (i as f32 - 16.0) * 0.25).collect();
        let vec_in: Vec<f32> = (0..n).map(|i| ((i as f32) * 0.2).cos()).collect();

        let mut wbytes = vec![0u8; Q4_0_BLOCK_BYTES];
        quantize_block_q4_0(&row, &mut wbytes);

        let mut f32_out = vec![0.0f32; d];
        matmul(FloatType::Q4_0, FloatType::F32, &mut f32_out, &f32_bytes(&vec_in), &wbytes, n, d, 1, 0).unwrap();

        let mut q8bytes = vec![0u8; Q8_0_BLOCK_BYTES];
        quantize_block_q8_0(&vec_in, &mut q8bytes);
        let mut q8_out = vec![0.0f32; d];
        matmul(FloatType::Q4_0, FloatType::Q8_0, &mut q8_out, &q8bytes, &wbytes, n, d, 1, 0).unwrap();

        assert!((f32_out[0] - q8_out[0]).abs() < 1.0, "got {} want {}", q8_out[0], f32_out[0]);
    }

    #[test]
    fn unsupported_pair_is_rejected() {
        let err = matmul(FloatType::F16, FloatType::Q8_0, &mut [0.0], &[0u8], &[0u8], 32, 1, 1, 0);
        assert!(err.is_err());
    }

    #[test]
    fn thread_partition_matches_single_thread_aggregate() {
        let mat = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let vec_in = vec![1.0f32, 1.0, 1.0];
        let weights = f32_bytes(&mat);
        let input = f32_bytes(&vec_in);

        let mut single = vec![0.0f32; 3];
        matmul(FloatType::F32, FloatType::F32, &mut single, &input, &weights, 3, 3, 1, 0).unwrap();

        let mut multi = vec![0.0f32; 3];
        for t in 0..3 {
            matmul(FloatType::F32, FloatType::F32, &mut multi, &input, &weights, 3, 3, 3, t).unwrap();
        }
        assert_eq!(single, multi);
    }
}
