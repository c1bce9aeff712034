//! Transformer weight state: one `TransformerBlock` per layer, holding
//! this node's row-slice of every projection in that layer, plus the
//! shared scratch buffers and (root-only) embedding/classifier weights.

use crate::buffer::TransformerBuffer;
use crate::kernels::matmul;
use crate::kv_cache::KvCache;
use crate::slice::MatmulSlice;
use crate::spec::{ArchType, FloatType, ModelSpec};
use shardllm_core::error::Result;

/// One attention/FFN layer's slice-owned weights.
pub struct TransformerBlock {
    pub rms_att: Vec<f32>,
    pub rms_ffn: Vec<f32>,
    /// GROK1 only: RMS factor gating the MoE router, applied before the
    /// router projection.
    pub rms_moe: Option<Vec<f32>>,
    /// GROK1 only: second post-FFN RMS factor applied before the residual
    /// merge (GROK1's block has two FFN-side norms where LLaMA has one).
    pub rms_ffn2: Option<Vec<f32>>,

    pub q0: Vec<u8>,
    pub q0_slice: MatmulSlice,
    pub k0: Vec<u8>,
    pub k0_slice: MatmulSlice,
    pub v0: Vec<u8>,
    pub v0_slice: MatmulSlice,
    pub wo0: Vec<u8>,
    pub wo0_slice: MatmulSlice,

    pub w10: Vec<u8>,
    pub w10_slice: MatmulSlice,
    pub w20: Vec<u8>,
    pub w20_slice: MatmulSlice,
    pub w30: Vec<u8>,
    pub w30_slice: MatmulSlice,

    /// MoE router: `[n_experts, dim]`, only populated when `spec.is_moe()`.
    pub moe_router: Vec<u8>,
    /// Per-expert FFN weights, only populated when `spec.is_moe()`.
    pub moe_experts: Vec<MoeExpertWeights>,
}

pub struct MoeExpertWeights {
    pub w1: Vec<u8>,
    pub w1_slice: MatmulSlice,
    pub w2: Vec<u8>,
    pub w2_slice: MatmulSlice,
    pub w3: Vec<u8>,
    pub w3_slice: MatmulSlice,
}

impl TransformerBlock {
    /// Allocate this node's slice-owned storage for one layer. `slice_index`
    /// picks which row range each projection's local buffer is sized for —
    /// slices are only equal-sized when `d % n_slices == 0`, so sizing off
    /// `bytes() / n_slices` instead of the slice's own `slice_bytes` would
    /// under-allocate whichever slice absorbs the rounding remainder.
    pub fn new(spec: &ModelSpec, slice_index: usize) -> Self {
        let n_slices = spec.n_slices as usize;
        let wft = spec.weights_float_type;

        let q0_slice = MatmulSlice::new(wft, n_slices, spec.dim as usize, spec.dim as usize);
        let k0_slice = MatmulSlice::new(wft, n_slices, spec.dim as usize, spec.kv_dim as usize);
        let v0_slice = MatmulSlice::new(wft, n_slices, spec.dim as usize, spec.kv_dim as usize);
        let wo0_slice = MatmulSlice::new(wft, n_slices, spec.dim as usize, spec.dim as usize);
        let w10_slice = MatmulSlice::new(wft, n_slices, spec.dim as usize, spec.hidden_dim as usize);
        let w20_slice = MatmulSlice::new(wft, n_slices, spec.hidden_dim as usize, spec.dim as usize);
        let w30_slice = MatmulSlice::new(wft, n_slices, spec.dim as usize, spec.hidden_dim as usize);

        let sliced = |s: &MatmulSlice| vec![0u8; s.slice_bytes(slice_index)];

        let (moe_router, moe_experts) = if spec.is_moe() {
            // The router is small and never sliced — every node replicates
            // it in full and routes identically, the same way RMS factors
            // are replicated rather than partitioned.
            let router_bytes = wft.row_bytes(spec.dim as usize) * spec.n_experts as usize;
            let experts = (0..spec.n_experts)
                .map(|_| {
                    let w1_slice = MatmulSlice::new(wft, n_slices, spec.dim as usize, spec.hidden_dim as usize);
                    let w2_slice = MatmulSlice::new(wft, n_slices, spec.hidden_dim as usize, spec.dim as usize);
                    let w3_slice = MatmulSlice::new(wft, n_slices, spec.dim as usize, spec.hidden_dim as usize);
                    MoeExpertWeights {
                        w1: sliced(&w1_slice),
                        w1_slice,
                        w2: sliced(&w2_slice),
                        w2_slice,
                        w3: sliced(&w3_slice),
                        w3_slice,
                    }
                })
                .collect();
            (vec![0u8; router_bytes], experts)
        } else {
            (Vec::new(), Vec::new())
        };

        let (rms_moe, rms_ffn2) = if spec.arch_type == ArchType::Grok1 {
            (Some(vec![0.0; spec.dim as usize]), Some(vec![0.0; spec.dim as usize]))
        } else {
            (None, None)
        };

        TransformerBlock {
            rms_att: vec![0.0; spec.dim as usize],
            rms_ffn: vec![0.0; spec.dim as usize],
            rms_moe,
            rms_ffn2,
            q0: sliced(&q0_slice),
            q0_slice,
            k0: sliced(&k0_slice),
            k0_slice,
            v0: sliced(&v0_slice),
            v0_slice,
            wo0: sliced(&wo0_slice),
            wo0_slice,
            w10: sliced(&w10_slice),
            w10_slice,
            w20: sliced(&w20_slice),
            w20_slice,
            w30: sliced(&w30_slice),
            w30_slice,
            moe_router,
            moe_experts,
        }
    }

    /// Project this slice's share of `xb` through `wo0` back into the
    /// unsliced residual-stream width, writing the partial result.
    pub fn attention_output(
        &self,
        partial: &mut [f32],
        xb: &[u8],
        act_kind: FloatType,
        slice_index: usize,
        n_threads: usize,
        thread_index: usize,
    ) -> Result<()> {
        let n = self.wo0_slice.n;
        let d = self.wo0_slice.d_sliced[slice_index];
        matmul(self.wo0_slice.float_type, act_kind, partial, xb, &self.wo0, n, d, n_threads, thread_index)
    }
}

/// Root-only weights: token embedding table, final norm and classifier head.
pub struct RootWeights {
    pub token_embedding_table: Vec<u8>,
    pub rms_final: Vec<f32>,
    pub wcls: Vec<u8>,
}

impl RootWeights {
    pub fn new(spec: &ModelSpec) -> Self {
        RootWeights {
            token_embedding_table: vec![0u8; spec.weights_float_type.row_bytes(spec.dim as usize) * spec.vocab_size as usize],
            rms_final: vec![0.0; spec.dim as usize],
            wcls: vec![0u8; spec.weights_float_type.row_bytes(spec.dim as usize) * spec.vocab_size as usize],
        }
    }
}

/// Full per-node transformer state: the layer stack, shared scratch
/// buffers, the KV cache (root only) and, on root, the embedding/classifier
/// weights.
pub struct Transformer {
    pub slice_index: usize,
    pub blocks: Vec<TransformerBlock>,
    pub buffer: TransformerBuffer,
    pub kv_cache: Option<KvCache>,
    pub root: Option<RootWeights>,
    pub x: Vec<f32>,
    pub logits: Vec<f32>,
    pub pos: usize,
}

impl Transformer {
    pub fn new(spec: &ModelSpec, slice_index: usize) -> Self {
        let is_root = slice_index == 0;
        let blocks = (0..spec.n_layers).map(|_| TransformerBlock::new(spec, slice_index)).collect();
        Transformer {
            slice_index,
            blocks,
            buffer: TransformerBuffer::new(spec),
            kv_cache: is_root.then(|| KvCache::new(spec.n_layers as usize, spec.seq_len as usize, spec.kv_dim as usize)),
            root: is_root.then(|| RootWeights::new(spec)),
            x: vec![0.0; spec.dim as usize],
            logits: if is_root { vec![0.0; spec.vocab_size as usize] } else { Vec::new() },
            pos: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.slice_index == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ArchType, HiddenAct};

    fn tiny_spec() -> ModelSpec {
        ModelSpec {
            arch_type: ArchType::Llama2,
            dim: 32,
            hidden_dim: 64,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 4,
            head_size: 8,
            kv_dim: 32,
            seq_len: 16,
            vocab_size: 50,
            n_experts: 0,
            n_active_experts: 0,
            hidden_act: HiddenAct::Silu,
            rope_theta: 10000.0,
            weights_float_type: FloatType::F32,
            buffer_float_type: FloatType::F32,
            n_slices: 2,
            header_size: 0,
            file_size: 0,
        }
    }

    #[test]
    fn root_owns_kv_cache_and_embedding_worker_does_not() {
        let spec = tiny_spec();
        let root = Transformer::new(&spec, 0);
        let worker = Transformer::new(&spec, 1);
        assert!(root.kv_cache.is_some());
        assert!(root.root.is_some());
        assert!(worker.kv_cache.is_none());
        assert!(worker.root.is_none());
    }

    #[test]
    fn block_slices_partition_the_full_projection() {
        let spec = tiny_spec();
        let block = TransformerBlock::new(&spec, 0);
        let total: usize = block.q0_slice.d_sliced.iter().sum();
        assert_eq!(total, spec.dim as usize);
    }

    #[test]
    fn block_storage_matches_its_own_slice_size_even_when_uneven() {
        let mut spec = tiny_spec();
        spec.n_slices = 3; // 32 dim / 3 slices is uneven; slice 2 absorbs the remainder
        let block = TransformerBlock::new(&spec, 2);
        assert_eq!(block.q0.len(), block.q0_slice.slice_bytes(2));
        assert_ne!(block.q0_slice.slice_bytes(0), block.q0_slice.slice_bytes(2));
    }
}
