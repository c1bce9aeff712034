//! Named scratch buffers shared by every transformer block during a
//! forward pass step.
//!
//! "Unit" buffers hold one copy of the whole (unsliced) vector; "sliced"
//! buffers are logically `n_slices` equal chunks, one per node, addressed
//! by `slice_index`. Each float-valued buffer has a quantized twin used
//! when the wire/activation dtype calls for it; when `buffer_float_type`
//! is `F32` the twin is simply never read.

use crate::quant::{dequantize_row, quantize_row};
use crate::spec::{FloatType, ModelSpec};
use shardllm_core::error::Result;

/// Which quantized/f32 buffer pair `dequantize_sliced_range` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicedBuf {
    Q,
    K,
    V,
    Xb2,
}

fn chunk<T>(buf: &[T], n_slices: usize, slice_index: usize) -> &[T] {
    let len = buf.len() / n_slices;
    &buf[slice_index * len..(slice_index + 1) * len]
}

fn chunk_mut<T>(buf: &mut [T], n_slices: usize, slice_index: usize) -> &mut [T] {
    let len = buf.len() / n_slices;
    &mut buf[slice_index * len..(slice_index + 1) * len]
}

pub struct TransformerBuffer {
    pub n_slices: usize,
    pub buffer_float_type: FloatType,

    pub unit_xb: Vec<f32>,
    pub unit_xb_q: Vec<u8>,

    pub sliced_xb2: Vec<f32>,
    pub sliced_xb2_q: Vec<u8>,

    pub sliced_q: Vec<f32>,
    pub sliced_q_q: Vec<u8>,

    pub sliced_k: Vec<f32>,
    pub sliced_k_q: Vec<u8>,

    pub sliced_v: Vec<f32>,
    pub sliced_v_q: Vec<u8>,

    pub sliced_hb: Vec<f32>,
    pub sliced_hb_q: Vec<u8>,
}

impl TransformerBuffer {
    pub fn new(spec: &ModelSpec) -> Self {
        let n_slices = spec.n_slices as usize;
        let bft = spec.buffer_float_type;

        let n_hb = if spec.is_moe() {
            spec.hidden_dim as usize * spec.n_active_experts as usize
        } else {
            spec.hidden_dim as usize
        };

        TransformerBuffer {
            n_slices,
            buffer_float_type: bft,
            unit_xb: vec![0.0; spec.dim as usize],
            unit_xb_q: vec![0u8; bft.row_bytes(spec.dim as usize)],
            sliced_xb2: vec![0.0; spec.dim as usize],
            sliced_xb2_q: vec![0u8; bft.row_bytes(spec.dim as usize)],
            sliced_q: vec![0.0; spec.dim as usize],
            sliced_q_q: vec![0u8; bft.row_bytes(spec.dim as usize)],
            sliced_k: vec![0.0; spec.kv_dim as usize],
            sliced_k_q: vec![0u8; bft.row_bytes(spec.kv_dim as usize)],
            sliced_v: vec![0.0; spec.kv_dim as usize],
            sliced_v_q: vec![0u8; bft.row_bytes(spec.kv_dim as usize)],
            sliced_hb: vec![0.0; n_hb],
            sliced_hb_q: vec![0u8; bft.row_bytes(n_hb)],
        }
    }

    pub fn sliced_q_slice(&self, slice_index: usize) -> &[f32] {
        chunk(&self.sliced_q, self.n_slices, slice_index)
    }
    pub fn sliced_q_slice_mut(&mut self, slice_index: usize) -> &mut [f32] {
        chunk_mut(&mut self.sliced_q, self.n_slices, slice_index)
    }
    pub fn sliced_k_slice(&self, slice_index: usize) -> &[f32] {
        chunk(&self.sliced_k, self.n_slices, slice_index)
    }
    pub fn sliced_v_slice(&self, slice_index: usize) -> &[f32] {
        chunk(&self.sliced_v, self.n_slices, slice_index)
    }
    pub fn sliced_hb_slice(&self, slice_index: usize) -> &[f32] {
        chunk(&self.sliced_hb, self.n_slices, slice_index)
    }
    pub fn sliced_hb_slice_mut(&mut self, slice_index: usize) -> &mut [f32] {
        chunk_mut(&mut self.sliced_hb, self.n_slices, slice_index)
    }
    pub fn sliced_xb2_slice(&self, slice_index: usize) -> &[f32] {
        chunk(&self.sliced_xb2, self.n_slices, slice_index)
    }

    /// The wire-dtype bytes of `[elem_off, elem_off+elem_len)` of one of the
    /// Q/K/V/xb2 buffers: raw floats, or the matching range of its `_q`
    /// twin. Used by the sync-side tasks to send a node's own row range.
    pub fn sliced_chunk_bytes(&self, which: SlicedBuf, elem_off: usize, elem_len: usize) -> Vec<u8> {
        let (f, q) = match which {
            SlicedBuf::Q => (&self.sliced_q, &self.sliced_q_q),
            SlicedBuf::K => (&self.sliced_k, &self.sliced_k_q),
            SlicedBuf::V => (&self.sliced_v, &self.sliced_v_q),
            SlicedBuf::Xb2 => (&self.sliced_xb2, &self.sliced_xb2_q),
        };
        if self.buffer_float_type == FloatType::F32 {
            f[elem_off..elem_off + elem_len].iter().flat_map(|v| v.to_le_bytes()).collect()
        } else {
            let off = self.buffer_float_type.row_bytes(elem_off);
            let len = self.buffer_float_type.row_bytes(elem_len);
            q[off..off + len].to_vec()
        }
    }

    /// Quantize `unit_xb` into `unit_xb_q`, partitioned by `(n_threads,
    /// thread_index)`. No-op (nothing to do) when the buffer dtype is F32.
    pub fn quantize_unit_xb(&mut self, n_threads: usize, thread_index: usize) -> Result<()> {
        if self.buffer_float_type == FloatType::F32 {
            return Ok(());
        }
        let n = self.unit_xb.len();
        quantize_row(&self.unit_xb, &mut self.unit_xb_q, n, self.buffer_float_type, n_threads, thread_index)
    }

    /// Quantize the whole `sliced_q` buffer into `sliced_q_q`. Each node
    /// only owns one contiguous row range of it, but quantizing the full
    /// width keeps this symmetric with `quantize_unit_xb` and lets the
    /// gather side dequantize whichever ranges it pulls off the wire.
    pub fn quantize_sliced_q(&mut self, n_threads: usize, thread_index: usize) -> Result<()> {
        if self.buffer_float_type == FloatType::F32 {
            return Ok(());
        }
        let n = self.sliced_q.len();
        quantize_row(&self.sliced_q, &mut self.sliced_q_q, n, self.buffer_float_type, n_threads, thread_index)
    }

    pub fn quantize_sliced_k(&mut self, n_threads: usize, thread_index: usize) -> Result<()> {
        if self.buffer_float_type == FloatType::F32 {
            return Ok(());
        }
        let n = self.sliced_k.len();
        quantize_row(&self.sliced_k, &mut self.sliced_k_q, n, self.buffer_float_type, n_threads, thread_index)
    }

    pub fn quantize_sliced_v(&mut self, n_threads: usize, thread_index: usize) -> Result<()> {
        if self.buffer_float_type == FloatType::F32 {
            return Ok(());
        }
        let n = self.sliced_v.len();
        quantize_row(&self.sliced_v, &mut self.sliced_v_q, n, self.buffer_float_type, n_threads, thread_index)
    }

    /// Quantize the whole `sliced_xb2` buffer; shared by the attention
    /// output and FFN2 output gather steps.
    pub fn quantize_sliced_xb2(&mut self, n_threads: usize, thread_index: usize) -> Result<()> {
        if self.buffer_float_type == FloatType::F32 {
            return Ok(());
        }
        let n = self.sliced_xb2.len();
        quantize_row(&self.sliced_xb2, &mut self.sliced_xb2_q, n, self.buffer_float_type, n_threads, thread_index)
    }

    /// Dequantize an arbitrary element range of `sliced_q_q`/`sliced_k_q`/
    /// `sliced_v_q`/`sliced_xb2_q` back into the matching f32 buffer. Used
    /// by the gather side to reconstruct just the worker-owned ranges it
    /// received on the wire, leaving the root's own range untouched.
    pub fn dequantize_sliced_range(
        &mut self,
        which: SlicedBuf,
        elem_off: usize,
        elem_len: usize,
        n_threads: usize,
        thread_index: usize,
    ) -> Result<()> {
        if self.buffer_float_type == FloatType::F32 {
            return Ok(());
        }
        let ft = self.buffer_float_type;
        let q_off = ft.row_bytes(elem_off);
        let q_len = ft.row_bytes(elem_len);
        let (q, f) = match which {
            SlicedBuf::Q => (&self.sliced_q_q[..], &mut self.sliced_q[..]),
            SlicedBuf::K => (&self.sliced_k_q[..], &mut self.sliced_k[..]),
            SlicedBuf::V => (&self.sliced_v_q[..], &mut self.sliced_v[..]),
            SlicedBuf::Xb2 => (&self.sliced_xb2_q[..], &mut self.sliced_xb2[..]),
        };
        dequantize_row(
            &q[q_off..q_off + q_len],
            &mut f[elem_off..elem_off + elem_len],
            elem_len,
            ft,
            n_threads,
            thread_index,
        )
    }

    /// Dequantize `sliced_hb_q`'s slice range back into `sliced_hb`.
    pub fn dequantize_sliced_hb(&mut self, slice_index: usize, n_threads: usize, thread_index: usize) -> Result<()> {
        if self.buffer_float_type == FloatType::F32 {
            return Ok(());
        }
        let n = self.sliced_hb.len() / self.n_slices;
        let q_row_bytes = self.buffer_float_type.row_bytes(n);
        let q_off = slice_index * q_row_bytes;
        let f_off = slice_index * n;
        dequantize_row(
            &self.sliced_hb_q[q_off..q_off + q_row_bytes],
            &mut self.sliced_hb[f_off..f_off + n],
            n,
            self.buffer_float_type,
            n_threads,
            thread_index,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ArchType, HiddenAct};

    fn tiny_spec(n_slices: u32, bft: FloatType) -> ModelSpec {
        ModelSpec {
            arch_type: ArchType::Llama2,
            dim: 64,
            hidden_dim: 128,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 4,
            head_size: 16,
            kv_dim: 64,
            seq_len: 32,
            vocab_size: 100,
            n_experts: 0,
            n_active_experts: 0,
            hidden_act: HiddenAct::Silu,
            rope_theta: 10000.0,
            weights_float_type: FloatType::F32,
            buffer_float_type: bft,
            n_slices,
            header_size: 0,
            file_size: 0,
        }
    }

    #[test]
    fn sliced_chunks_partition_the_whole_buffer() {
        let spec = tiny_spec(4, FloatType::F32);
        let buf = TransformerBuffer::new(&spec);
        let mut seen = 0;
        for s in 0..4 {
            seen += buf.sliced_q_slice(s).len();
        }
        assert_eq!(seen, buf.sliced_q.len());
    }

    #[test]
    fn quantize_unit_xb_round_trips_through_dequantize() {
        let spec = tiny_spec(1, FloatType::Q8_0);
        let mut buf = TransformerBuffer::new(&spec);
        for (i, x) in buf.unit_xb.iter_mut().enumerate() {
            *x = (i as f32 - 32.0) * 0.5;
        }
        buf.quantize_unit_xb(1, 0).unwrap();

        let mut restored = vec![0.0f32; buf.unit_xb.len()];
        dequantize_row(&buf.unit_xb_q, &mut restored, buf.unit_xb.len(), FloatType::Q8_0, 1, 0).unwrap();
        for (a, b) in buf.unit_xb.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 1.0);
        }
    }
}
