//! Row-wise weight slicing — splits a `[d, n]` weight matrix across
//! `n_slices` nodes by output row, and merges per-slice output vectors
//! back into the unsliced `d`-length vector.
//!
//! Slice widths come from a non-negative integer weight vector (uniform
//! `[nSlices, nSlices, ...]` by default, letting a heterogeneous cluster
//! give some nodes a larger row share): `d_sliced[i] = ⌊d·w[i]/Σw⌋` for
//! every slice but the last, which absorbs the rounding remainder so
//! `Σ d_sliced == d` exactly.

use crate::spec::FloatType;

/// Describes how one projection matrix's `d` output rows are distributed
/// across `n_slices` nodes.
#[derive(Debug, Clone)]
pub struct MatmulSlice {
    pub float_type: FloatType,
    pub n_slices: usize,
    /// Input dimension (columns), shared by every slice.
    pub n: usize,
    /// Full (unsliced) output dimension.
    pub d: usize,
    /// Number of output rows owned by each slice index.
    pub d_sliced: Vec<usize>,
    /// Starting row index of each slice in the unsliced output vector.
    pub d_index: Vec<usize>,
}

impl MatmulSlice {
    /// Uniform partition: weight vector `[nSlices, nSlices, ..., nSlices]`.
    pub fn new(float_type: FloatType, n_slices: usize, n: usize, d: usize) -> Self {
        let weights = vec![n_slices as u64; n_slices];
        Self::with_weights(float_type, n, d, &weights)
    }

    /// Partition `d` rows by an explicit non-negative integer weight
    /// vector, one entry per slice, with `Σw > 0`.
    pub fn with_weights(float_type: FloatType, n: usize, d: usize, weights: &[u64]) -> Self {
        let n_slices = weights.len();
        debug_assert!(n_slices > 0);
        let total: u64 = weights.iter().sum();
        debug_assert!(total > 0, "slice weight vector must have a positive sum");

        let mut d_sliced = Vec::with_capacity(n_slices);
        let mut d_index = Vec::with_capacity(n_slices);
        let mut assigned = 0usize;
        let mut offset = 0usize;

        for (i, &w) in weights.iter().enumerate() {
            let size = if i + 1 == n_slices {
                d - assigned
            } else {
                ((d as u64 * w) / total) as usize
            };
            d_index.push(offset);
            d_sliced.push(size);
            assigned += size;
            offset += size;
        }

        MatmulSlice {
            float_type,
            n_slices,
            n,
            d,
            d_sliced,
            d_index,
        }
    }

    /// Total bytes the full (unsliced) weight matrix occupies.
    pub fn bytes(&self) -> usize {
        self.float_type.row_bytes(self.n) * self.d
    }

    /// Bytes owned by a single slice's row range.
    pub fn slice_bytes(&self, slice_index: usize) -> usize {
        self.float_type.row_bytes(self.n) * self.d_sliced[slice_index]
    }

    /// Copy `slice_index`'s row range out of the full weight matrix
    /// `weights` (row-major, `d` rows of `n` columns) into `dst`, at
    /// block-sized ("batch") granularity. Returns the number of bytes
    /// copied, which equals `slice_bytes(slice_index)`.
    pub fn split_weights(&self, slice_index: usize, weights: &[u8], dst: &mut [u8]) -> usize {
        let row_bytes = self.float_type.row_bytes(self.n);
        let offset = self.d_index[slice_index] * row_bytes;
        let len = self.d_sliced[slice_index] * row_bytes;
        dst[..len].copy_from_slice(&weights[offset..offset + len]);
        len
    }

    /// Scatter a slice's partial output vector into its row range of the
    /// full output vector. Returns the row offset the slice starts at.
    pub fn merge_outputs(&self, slice_index: usize, output: &mut [f32], partial: &[f32]) -> usize {
        let offset = self.d_index[slice_index];
        let len = self.d_sliced[slice_index];
        output[offset..offset + len].copy_from_slice(&partial[..len]);
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_partition_covers_every_row_exactly_once() {
        let slice = MatmulSlice::new(FloatType::F32, 3, 64, 100);
        let mut covered = vec![false; 100];
        for i in 0..3 {
            let start = slice.d_index[i];
            let end = start + slice.d_sliced[i];
            for r in start..end {
                assert!(!covered[r], "row {r} covered twice");
                covered[r] = true;
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn heterogeneous_weights_match_the_documented_example() {
        let slice = MatmulSlice::with_weights(FloatType::F32, 1, 10, &[1, 2, 2]);
        assert_eq!(slice.d_sliced, vec![2, 4, 4]);
        assert_eq!(slice.d_index, vec![0, 2, 6]);
    }

    #[test]
    fn split_then_merge_round_trips_identity() {
        let n = 32;
        let d = 10;
        let n_slices = 3;
        let slice = MatmulSlice::new(FloatType::F32, n_slices, n, d);

        let mut weights = vec![0u8; slice.bytes()];
        for (i, b) in weights.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }

        let mut merged_output = vec![0.0f32; d];
        for s in 0..n_slices {
            let mut piece = vec![0u8; slice.slice_bytes(s)];
            let copied = slice.split_weights(s, &weights, &mut piece);
            assert_eq!(copied, slice.slice_bytes(s));

            let partial: Vec<f32> = (0..slice.d_sliced[s]).map(|i| (s * 100 + i) as f32).collect();
            slice.merge_outputs(s, &mut merged_output, &partial);
        }

        for s in 0..n_slices {
            let start = slice.d_index[s];
            for i in 0..slice.d_sliced[s] {
                assert_eq!(merged_output[start + i], (s * 100 + i) as f32);
            }
        }
    }

    #[test]
    fn handles_d_not_divisible_by_n_slices() {
        let slice = MatmulSlice::new(FloatType::Q4_0, 3, 32, 10);
        let total: usize = slice.d_sliced.iter().sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn identity_merge_of_heterogeneous_slices_reproduces_the_original_vector() {
        let slice = MatmulSlice::with_weights(FloatType::F32, 1, 10, &[1, 2, 2]);
        let expected: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let mut merged = vec![0.0f32; 10];
        for s in 0..3 {
            let start = slice.d_index[s];
            let partial: Vec<f32> = (0..slice.d_sliced[s]).map(|i| (start + i) as f32).collect();
            slice.merge_outputs(s, &mut merged, &partial);
        }
        assert_eq!(merged, expected);
    }
}
