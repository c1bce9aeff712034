//! Quantization codec — encode/decode 32-bit floats to/from the Q4_0 and
//! Q8_0 block formats.
//!
//! Block layout: each block covers 32 source floats and is stored as a
//! 16-bit float scale followed by the packed quants (16 packed nibbles for
//! Q4_0, 32 signed bytes for Q8_0).

use crate::spec::FloatType;
use shardllm_core::error::{Result, ShardLlmError};

pub const BLOCK_SIZE: usize = 32;
pub const Q4_0_BLOCK_BYTES: usize = 18;
pub const Q8_0_BLOCK_BYTES: usize = 34;

/// Quantize one block of 32 floats into Q8_0: scale (f16) + 32 i8 quants.
pub fn quantize_block_q8_0(src: &[f32], dst: &mut [u8]) {
    debug_assert_eq!(src.len(), BLOCK_SIZE);
    debug_assert!(dst.len() >= Q8_0_BLOCK_BYTES);

    let amax = src.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()));
    let d = if amax == 0.0 { 0.0 } else { amax / 127.0 };
    let inv_d = if d == 0.0 { 0.0 } else { 1.0 / d };

    let scale_bytes = half::f16::from_f32(d).to_le_bytes();
    dst[0] = scale_bytes[0];
    dst[1] = scale_bytes[1];

    for (i, &x) in src.iter().enumerate() {
        let q = (x * inv_d).round().clamp(-127.0, 127.0) as i8;
        dst[2 + i] = q as u8;
    }
}

/// Dequantize one Q8_0 block (34 bytes) to 32 f32 values.
pub fn dequantize_block_q8_0(block: &[u8], output: &mut [f32]) {
    debug_assert!(block.len() >= Q8_0_BLOCK_BYTES);
    debug_assert!(output.len() >= BLOCK_SIZE);

    let scale = half::f16::from_le_bytes([block[0], block[1]]).to_f32();
    for (out, &byte) in output.iter_mut().zip(&block[2..2 + BLOCK_SIZE]) {
        *out = byte as i8 as f32 * scale;
    }
}

/// Quantize one block of 32 floats into Q4_0: scale (f16) + 16 packed nibbles.
pub fn quantize_block_q4_0(src: &[f32], dst: &mut [u8]) {
    debug_assert_eq!(src.len(), BLOCK_SIZE);
    debug_assert!(dst.len() >= Q4_0_BLOCK_BYTES);

    let mut max = 0.0f32;
    for &x in src {
        if x.abs() > max.abs() {
            max = x;
        }
    }
    let d = max / -8.0;
    let inv_d = if d == 0.0 { 0.0 } else { 1.0 / d };

    let scale_bytes = half::f16::from_f32(d).to_le_bytes();
    dst[0] = scale_bytes[0];
    dst[1] = scale_bytes[1];

    for i in 0..16 {
        let x0 = src[i];
        let x1 = src[i + 16];
        let q0 = ((x0 * inv_d).round() as i32 + 8).clamp(0, 15) as u8;
        let q1 = ((x1 * inv_d).round() as i32 + 8).clamp(0, 15) as u8;
        dst[2 + i] = q0 | (q1 << 4);
    }
}

/// Dequantize one Q4_0 block (18 bytes) to 32 f32 values.
pub fn dequantize_block_q4_0(block: &[u8], output: &mut [f32]) {
    debug_assert!(block.len() >= Q4_0_BLOCK_BYTES);
    debug_assert!(output.len() >= BLOCK_SIZE);

    let scale = half::f16::from_le_bytes([block[0], block[1]]).to_f32();
    for (i, &byte) in block[2..2 + 16].iter().enumerate() {
        let lo = (byte & 0x0F) as f32 - 8.0;
        let hi = ((byte >> 4) & 0x0F) as f32 - 8.0;
        output[i] = lo * scale;
        output[i + 16] = hi * scale;
    }
}

/// Quantize a full row (n must be a multiple of 32) into Q8_0 blocks.
/// Parallelizable: `(n_threads, thread_index)` partitions the block range.
pub fn quantize_row_q8_0(src: &[f32], dst: &mut [u8], n: usize, n_threads: usize, thread_index: usize) {
    debug_assert_eq!(n % BLOCK_SIZE, 0);
    let n_blocks = n / BLOCK_SIZE;
    let (bs, be) = thread_block_range(n_blocks, n_threads, thread_index);
    for b in bs..be {
        let src_block = &src[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE];
        let dst_block = &mut dst[b * Q8_0_BLOCK_BYTES..(b + 1) * Q8_0_BLOCK_BYTES];
        quantize_block_q8_0(src_block, dst_block);
    }
}

/// Quantize a full row into Q4_0 blocks, parallelizable as above.
pub fn quantize_row_q4_0(src: &[f32], dst: &mut [u8], n: usize, n_threads: usize, thread_index: usize) {
    debug_assert_eq!(n % BLOCK_SIZE, 0);
    let n_blocks = n / BLOCK_SIZE;
    let (bs, be) = thread_block_range(n_blocks, n_threads, thread_index);
    for b in bs..be {
        let src_block = &src[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE];
        let dst_block = &mut dst[b * Q4_0_BLOCK_BYTES..(b + 1) * Q4_0_BLOCK_BYTES];
        quantize_block_q4_0(src_block, dst_block);
    }
}

/// Dequantize a full row of `n` elements stored as `kind`, parallelizable.
pub fn dequantize_row(
    data: &[u8],
    output: &mut [f32],
    n: usize,
    kind: FloatType,
    n_threads: usize,
    thread_index: usize,
) -> Result<()> {
    match kind {
        FloatType::F32 => {
            let (es, ee) = thread_block_range(n, n_threads, thread_index);
            for i in es..ee {
                let o = i * 4;
                output[i] = f32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
            }
        }
        FloatType::F16 => {
            let (es, ee) = thread_block_range(n, n_threads, thread_index);
            for i in es..ee {
                let o = i * 2;
                output[i] = half::f16::from_le_bytes([data[o], data[o + 1]]).to_f32();
            }
        }
        FloatType::Q4_0 => {
            debug_assert_eq!(n % BLOCK_SIZE, 0);
            let n_blocks = n / BLOCK_SIZE;
            let (bs, be) = thread_block_range(n_blocks, n_threads, thread_index);
            for b in bs..be {
                let block = &data[b * Q4_0_BLOCK_BYTES..(b + 1) * Q4_0_BLOCK_BYTES];
                dequantize_block_q4_0(block, &mut output[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE]);
            }
        }
        FloatType::Q8_0 => {
            debug_assert_eq!(n % BLOCK_SIZE, 0);
            let n_blocks = n / BLOCK_SIZE;
            let (bs, be) = thread_block_range(n_blocks, n_threads, thread_index);
            for b in bs..be {
                let block = &data[b * Q8_0_BLOCK_BYTES..(b + 1) * Q8_0_BLOCK_BYTES];
                dequantize_block_q8_0(block, &mut output[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE]);
            }
        }
    }
    Ok(())
}

/// Quantize a full row into `kind`'s block format. Returns `UnsupportedDType`
/// for F16 (no quantized encode target is ever needed for F16 buffers).
pub fn quantize_row(
    src: &[f32],
    dst: &mut [u8],
    n: usize,
    kind: FloatType,
    n_threads: usize,
    thread_index: usize,
) -> Result<()> {
    match kind {
        FloatType::F32 => {
            let (es, ee) = thread_block_range(n, n_threads, thread_index);
            for i in es..ee {
                let bytes = src[i].to_le_bytes();
                dst[i * 4..i * 4 + 4].copy_from_slice(&bytes);
            }
            Ok(())
        }
        FloatType::Q8_0 => {
            quantize_row_q8_0(src, dst, n, n_threads, thread_index);
            Ok(())
        }
        FloatType::Q4_0 => {
            quantize_row_q4_0(src, dst, n, n_threads, thread_index);
            Ok(())
        }
        FloatType::F16 => Err(ShardLlmError::UnsupportedDType {
            weight_kind: "F32".into(),
            activation_kind: "F16".into(),
        }),
    }
}

/// Split `n_units` units across `n_threads` the same way the matmul/scheduler
/// contract partitions output rows: `[⌊t·n/T⌋, ⌊(t+1)·n/T⌋)`.
pub fn thread_block_range(n_units: usize, n_threads: usize, thread_index: usize) -> (usize, usize) {
    if n_threads == 0 {
        return (0, n_units);
    }
    let start = thread_index * n_units / n_threads;
    let end = (thread_index + 1) * n_units / n_threads;
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q8_0_round_trip_bound() {
        let src: Vec<f32> = (0..32).map(|i| (i as f32 - 16.0) * 1.7).collect();
        let mut block = vec![0u8; Q8_0_BLOCK_BYTES];
        quantize_block_q8_0(&src, &mut block);
        let mut out = vec![0.0f32; BLOCK_SIZE];
        dequantize_block_q8_0(&block, &mut out);

        let amax = src.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()));
        let bound = amax / 127.0;
        for (a, b) in src.iter().zip(out.iter()) {
            assert!((a - b).abs() <= bound + 1e-4, "a={a} b={b} bound={bound}");
        }
    }

    #[test]
    fn q4_0_round_trip_bound() {
        let src: Vec<f32> = (0..32).map(|i| (i as f32 - 16.0) * 0.9).collect();
        let mut block = vec![0u8; Q4_0_BLOCK_BYTES];
        quantize_block_q4_0(&src, &mut block);
        let mut out = vec![0.0f32; BLOCK_SIZE];
        dequantize_block_q4_0(&block, &mut out);

        let amax = src.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()));
        let bound = amax / 7.0;
        for (a, b) in src.iter().zip(out.iter()) {
            assert!((a - b).abs() <= bound + 1e-3, "a={a} b={b} bound={bound}");
        }
    }

    #[test]
    fn q8_0_exact_scale_one() {
        let scale_bytes = half::f16::from_f32(1.0).to_le_bytes();
        let mut block = vec![0u8; Q8_0_BLOCK_BYTES];
        block[0] = scale_bytes[0];
        block[1] = scale_bytes[1];
        for i in 0..32 {
            block[2 + i] = (i + 1) as u8;
        }
        let mut output = vec![0.0f32; 32];
        dequantize_block_q8_0(&block, &mut output);
        assert!((output[0] - 1.0).abs() < 0.01);
        assert!((output[1] - 2.0).abs() < 0.01);
    }

    #[test]
    fn thread_partition_covers_all_blocks_exactly_once() {
        let n_blocks = 10;
        let n_threads = 3;
        let mut covered = vec![false; n_blocks];
        for t in 0..n_threads {
            let (s, e) = thread_block_range(n_blocks, n_threads, t);
            for b in s..e {
                assert!(!covered[b], "block {b} covered twice");
                covered[b] = true;
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn dequantize_row_f32_direct_copy() {
        let floats = [1.0f32, 2.0, 3.0, 4.0];
        let mut bytes = Vec::new();
        for f in floats {
            bytes.extend_from_slice(&f.to_le_bytes());
        }
        let mut out = vec![0.0f32; 4];
        dequantize_row(&bytes, &mut out, 4, FloatType::F32, 1, 0).unwrap();
        assert_eq!(out, floats);
    }
}
