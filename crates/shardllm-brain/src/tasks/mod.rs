//! Forward-pass task pipeline: the root's 32-step ordered task list and
//! the worker's 17-step subset, sharing one `TransformerContext` and the
//! sync primitives in [`sync`].

pub mod root;
pub mod sync;
pub mod worker;

use crate::attention::multi_head_attention;
use crate::kernels::matmul;
use crate::kv_cache::KvCache;
use crate::quant::dequantize_row;
use crate::rope::apply_rope;
use crate::spec::{FloatType, HiddenAct, ModelSpec};
use crate::tensor::{elementwise_add, elementwise_mul, rms, rmsnorm_apply, silu};
use crate::transformer::Transformer;
use crate::transport::SocketPool;
use shardllm_core::error::Result;
use std::sync::Mutex;

const RMS_EPS: f32 = 1e-5;

/// Shared mutable pipeline state. Every task locks this once per thread
/// call; the lock is held only for the duration of that thread's own
/// row range and is always released before the next barrier wait, so it
/// never serializes work across the barrier itself.
pub struct NodeState {
    pub spec: ModelSpec,
    pub transformer: Transformer,
    pub token: u32,
    pub current_block_index: usize,
    pub finalize: bool,
    /// Reciprocal RMS computed by the preceding reduction task (`rmsAtt`/
    /// `rmsFfn`/`rmsFinal`), consumed by its paired `*Norm` task.
    pub rms_value: f32,
    pub peers: Option<SocketPool>,
    /// `(expert_index, normalized_gate_weight)` chosen by this step's MoE
    /// router, populated by `step_ffn` and consumed by `step_ffn2`. Empty
    /// for dense models.
    pub moe_active: Vec<(usize, f32)>,
}

pub struct TransformerContext {
    pub state: Mutex<NodeState>,
}

impl TransformerContext {
    pub fn new(spec: ModelSpec, transformer: Transformer, peers: Option<SocketPool>) -> Self {
        TransformerContext {
            state: Mutex::new(NodeState {
                spec,
                transformer,
                token: 0,
                current_block_index: 0,
                finalize: false,
                rms_value: 0.0,
                peers,
                moe_active: Vec::new(),
            }),
        }
    }
}

fn f32_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// The activation bytes the next matmul should read: the unsliced buffer's
/// quantized twin if the wire dtype calls for it, else the raw floats.
fn unit_xb_bytes(st: &NodeState) -> Vec<u8> {
    if st.spec.buffer_float_type == FloatType::F32 {
        f32_to_bytes(&st.transformer.buffer.unit_xb)
    } else {
        st.transformer.buffer.unit_xb_q.clone()
    }
}

fn sliced_hb_bytes(st: &NodeState) -> Vec<u8> {
    if st.spec.buffer_float_type == FloatType::F32 {
        f32_to_bytes(&st.transformer.buffer.sliced_hb)
    } else {
        st.transformer.buffer.sliced_hb_q.clone()
    }
}

/// Wire length, in bytes, of the unsliced activation buffer under the
/// current buffer dtype.
fn unit_xb_wire_len(st: &NodeState) -> usize {
    let dim = st.spec.dim as usize;
    if st.spec.buffer_float_type == FloatType::F32 {
        dim * 4
    } else {
        st.spec.buffer_float_type.row_bytes(dim)
    }
}

/// Store bytes received over the wire into `unit_xb`/`unit_xb_q`, whichever
/// the buffer dtype calls for. The float form is only populated for F32
/// buffers — every matmul reads the quantized form directly otherwise.
fn receive_unit_xb(st: &mut NodeState, bytes: &[u8]) {
    if st.spec.buffer_float_type == FloatType::F32 {
        for (i, c) in bytes.chunks_exact(4).enumerate() {
            st.transformer.buffer.unit_xb[i] = f32::from_le_bytes(c.try_into().unwrap());
        }
    } else {
        st.transformer.buffer.unit_xb_q.copy_from_slice(bytes);
    }
}

/// Wire byte length of `n_elems` contiguous elements under `ft` — `n * 4`
/// for raw floats, or the packed quantized length (valid only when
/// `n_elems` lands on a block boundary, which every `MatmulSlice` row
/// range does by construction).
fn elem_to_wire_bytes(ft: FloatType, n_elems: usize) -> usize {
    if ft == FloatType::F32 {
        n_elems * 4
    } else {
        ft.row_bytes(n_elems)
    }
}

/// `(byte offset, byte length)` of each worker's (socket index `0..n_slices-1`,
/// i.e. slice index `1..n_slices`) row range within one of `slice`'s
/// unsliced output vectors, under wire dtype `ft`. Offsets are absolute
/// within the full unsliced vector (root's own slice 0 occupies
/// `[0, worker_region_start_bytes(slice, ft))` in front of them).
fn worker_byte_offsets(slice: &crate::slice::MatmulSlice, ft: FloatType) -> Vec<(usize, usize)> {
    (1..slice.n_slices)
        .map(|i| (elem_to_wire_bytes(ft, slice.d_index[i]), elem_to_wire_bytes(ft, slice.d_sliced[i])))
        .collect()
}

/// Re-zero a set of absolute worker offsets to be relative to the start of
/// the worker-only region, contiguous from 0 — the layout `sync::gather`
/// expects, since it treats the buffer it's given as starting exactly at
/// the first worker's data.
fn relative_to_worker_region(absolute: &[(usize, usize)]) -> Vec<(usize, usize)> {
    let base = absolute.first().map(|&(o, _)| o).unwrap_or(0);
    absolute.iter().map(|&(o, l)| (o - base, l)).collect()
}

// ---- embed ----------------------------------------------------------------

/// Root-only, outside the scheduled task list: look up `st.token`'s row in
/// the embedding table and copy it into the residual stream `x`, ready for
/// the first layer's `rmsAtt`. Called once per generated token, before the
/// pipeline runs its `n_layers` passes.
pub fn embed_token(st: &mut NodeState) -> Result<()> {
    let dim = st.spec.dim as usize;
    let wft = st.spec.weights_float_type;
    let row_bytes = wft.row_bytes(dim);
    let root = st.transformer.root.as_ref().expect("embed_token requires root weights");
    let offset = st.token as usize * row_bytes;
    let row = &root.token_embedding_table[offset..offset + row_bytes];
    dequantize_row(row, &mut st.transformer.x, dim, wft, 1, 0)
}

// ---- rmsAtt / rmsAttNorm -------------------------------------------------

pub fn step_rms_att(st: &mut NodeState) {
    st.rms_value = rms(&st.transformer.x, RMS_EPS);
}

pub fn step_rms_att_norm(st: &mut NodeState, n_threads: usize, thread_index: usize) {
    let idx = st.current_block_index;
    let weight = st.transformer.blocks[idx].rms_att.clone();
    let x = st.transformer.x.clone();
    let rms_value = st.rms_value;
    rmsnorm_apply(&mut st.transformer.buffer.unit_xb, &x, &weight, rms_value, n_threads, thread_index);
}

pub fn step_quantize_rms_att(st: &mut NodeState, n_threads: usize, thread_index: usize) -> Result<()> {
    st.transformer.buffer.quantize_unit_xb(n_threads, thread_index)
}

// ---- qkv ------------------------------------------------------------------

/// This node's slice of Q/K/V, via its own row-sliced weights.
pub fn step_qkv(st: &mut NodeState, slice_index: usize, n_threads: usize, thread_index: usize) -> Result<()> {
    let act_kind = st.spec.buffer_float_type;
    let input = unit_xb_bytes(st);
    let idx = st.current_block_index;
    let block = &st.transformer.blocks[idx];

    let n = block.q0_slice.n;
    let mut q_partial = vec![0.0f32; block.q0_slice.d_sliced[slice_index]];
    matmul(block.q0_slice.float_type, act_kind, &mut q_partial, &input, &block.q0, n, q_partial.len(), n_threads, thread_index)?;

    let mut k_partial = vec![0.0f32; block.k0_slice.d_sliced[slice_index]];
    matmul(block.k0_slice.float_type, act_kind, &mut k_partial, &input, &block.k0, n, k_partial.len(), n_threads, thread_index)?;

    let mut v_partial = vec![0.0f32; block.v0_slice.d_sliced[slice_index]];
    matmul(block.v0_slice.float_type, act_kind, &mut v_partial, &input, &block.v0, n, v_partial.len(), n_threads, thread_index)?;

    // Q/K/V are output-sliced (each node owns a disjoint row range of the
    // unsliced vector), so the partial must land at this slice's own
    // offset, not at the front of the buffer — every slice but the last
    // would otherwise collide at [0..len).
    let q_off = block.q0_slice.d_index[slice_index];
    let k_off = block.k0_slice.d_index[slice_index];
    let v_off = block.v0_slice.d_index[slice_index];
    let buf = &mut st.transformer.buffer;
    buf.sliced_q[q_off..q_off + q_partial.len()].copy_from_slice(&q_partial);
    buf.sliced_k[k_off..k_off + k_partial.len()].copy_from_slice(&k_partial);
    buf.sliced_v[v_off..v_off + v_partial.len()].copy_from_slice(&v_partial);
    Ok(())
}

pub fn step_quantize_qkv(st: &mut NodeState, n_threads: usize, thread_index: usize) -> Result<()> {
    st.transformer.buffer.quantize_sliced_q(n_threads, thread_index)?;
    st.transformer.buffer.quantize_sliced_k(n_threads, thread_index)?;
    st.transformer.buffer.quantize_sliced_v(n_threads, thread_index)
}

// ---- multiheadAtt -----------------------------------------------------------

/// Root-only. Applies RoPE to the (already gathered) full Q/K, writes
/// K/V into the cache at `pos`, then runs attention per head.
pub fn step_multihead_att(st: &mut NodeState) {
    let pos = st.transformer.pos;
    let dim = st.spec.dim as usize;
    let kv_dim = st.spec.kv_dim as usize;
    let head_size = st.spec.head_size as usize;
    let n_heads = st.spec.n_heads as usize;
    let n_kv_heads = st.spec.n_kv_heads as usize;
    let theta = st.spec.rope_theta;
    let layer = st.current_block_index;

    let mut q = std::mem::take(&mut st.transformer.buffer.sliced_q);
    let mut k = std::mem::take(&mut st.transformer.buffer.sliced_k);
    let v = st.transformer.buffer.sliced_v.clone();

    apply_rope(&mut q[..dim], Some(&mut k[..kv_dim]), pos, dim, kv_dim, head_size, theta);

    {
        let cache: &mut KvCache = st.transformer.kv_cache.as_mut().expect("multiheadAtt requires root's KV cache");
        cache.key_at_mut(layer, pos).copy_from_slice(&k[..kv_dim]);
        cache.value_at_mut(layer, pos).copy_from_slice(&v[..kv_dim]);
    }

    let cache = st.transformer.kv_cache.as_ref().unwrap();
    multi_head_attention(&mut st.transformer.buffer.unit_xb, &q[..dim], cache, layer, pos, n_heads, n_kv_heads, head_size);

    st.transformer.buffer.sliced_q = q;
    st.transformer.buffer.sliced_k = k;
}

pub fn step_quantize_multihead_att(st: &mut NodeState, n_threads: usize, thread_index: usize) -> Result<()> {
    st.transformer.buffer.quantize_unit_xb(n_threads, thread_index)
}

// ---- att --------------------------------------------------------------------

/// This node's slice of the output projection `Wo · xb`.
pub fn step_att(st: &mut NodeState, slice_index: usize, n_threads: usize, thread_index: usize) -> Result<()> {
    let act_kind = st.spec.buffer_float_type;
    let input = unit_xb_bytes(st);
    let idx = st.current_block_index;
    let block = &st.transformer.blocks[idx];
    let mut partial = vec![0.0f32; block.wo0_slice.d_sliced[slice_index]];
    block.attention_output(&mut partial, &input, act_kind, slice_index, n_threads, thread_index)?;
    // Wo is output-sliced like Q/K/V: this slice's rows land at its own
    // offset in the reconstructed full-width vector.
    let off = block.wo0_slice.d_index[slice_index];
    st.transformer.buffer.sliced_xb2[off..off + partial.len()].copy_from_slice(&partial);
    Ok(())
}

pub fn step_quantize_att(st: &mut NodeState, n_threads: usize, thread_index: usize) -> Result<()> {
    st.transformer.buffer.quantize_sliced_xb2(n_threads, thread_index)
}

pub fn step_residual_att(st: &mut NodeState) {
    let len = st.transformer.x.len();
    let xb2 = st.transformer.buffer.sliced_xb2[..len].to_vec();
    elementwise_add(&mut st.transformer.x, &xb2);
}

// ---- rmsFfn / rmsFfnNorm ------------------------------------------------

pub fn step_rms_ffn(st: &mut NodeState) {
    st.rms_value = rms(&st.transformer.x, RMS_EPS);
}

pub fn step_rms_ffn_norm(st: &mut NodeState, n_threads: usize, thread_index: usize) {
    let idx = st.current_block_index;
    let weight = st.transformer.blocks[idx].rms_ffn.clone();
    let x = st.transformer.x.clone();
    let rms_value = st.rms_value;
    rmsnorm_apply(&mut st.transformer.buffer.unit_xb, &x, &weight, rms_value, n_threads, thread_index);
}

pub fn step_quantize_rms_ffn(st: &mut NodeState, n_threads: usize, thread_index: usize) -> Result<()> {
    st.transformer.buffer.quantize_unit_xb(n_threads, thread_index)
}

// ---- MoE routing ---------------------------------------------------------

/// Router logits and top-`n_active_experts` selection over the unsliced
/// normalized activation. The router matrix is replicated in full on every
/// node (never sliced, like the RMS factors), so every node reaches the same
/// selection independently — no synchronization needed to keep routing
/// consistent across slices.
fn select_moe_experts(st: &mut NodeState) -> Result<()> {
    let idx = st.current_block_index;
    let block = &st.transformer.blocks[idx];
    let wft = st.spec.weights_float_type;
    let n_experts = st.spec.n_experts as usize;
    let n_active = st.spec.n_active_experts as usize;
    let dim = st.spec.dim as usize;

    let x_bytes = f32_to_bytes(&st.transformer.buffer.unit_xb);
    let mut logits = vec![0.0f32; n_experts];
    matmul(wft, FloatType::F32, &mut logits, &x_bytes, &block.moe_router, dim, n_experts, 1, 0)?;

    let mut ranked: Vec<usize> = (0..n_experts).collect();
    ranked.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap());
    ranked.truncate(n_active);

    let mut weights: Vec<f32> = ranked.iter().map(|&i| logits[i]).collect();
    crate::tensor::softmax(&mut weights);

    st.moe_active = ranked.into_iter().zip(weights).collect();
    Ok(())
}

// ---- ffn / ffn2 ---------------------------------------------------------

/// This node's slice of `HB = act(W1·xb) ⊙ (W3·xb)`, dense or per-expert.
pub fn step_ffn(st: &mut NodeState, slice_index: usize, n_threads: usize, thread_index: usize) -> Result<()> {
    if st.spec.is_moe() {
        step_ffn_moe(st, slice_index, n_threads, thread_index)
    } else {
        step_ffn_dense(st, slice_index, n_threads, thread_index)
    }
}

fn step_ffn_dense(st: &mut NodeState, slice_index: usize, n_threads: usize, thread_index: usize) -> Result<()> {
    let act_kind = st.spec.buffer_float_type;
    let hidden_act = st.spec.hidden_act;
    let input = unit_xb_bytes(st);
    let idx = st.current_block_index;
    let block = &st.transformer.blocks[idx];
    let n = block.w10_slice.n;
    let d = block.w10_slice.d_sliced[slice_index];

    let mut gate = vec![0.0f32; d];
    matmul(block.w10_slice.float_type, act_kind, &mut gate, &input, &block.w10, n, d, n_threads, thread_index)?;
    let mut up = vec![0.0f32; d];
    matmul(block.w30_slice.float_type, act_kind, &mut up, &input, &block.w30, n, d, n_threads, thread_index)?;

    match hidden_act {
        HiddenAct::Silu => silu(&mut gate),
        HiddenAct::Gelu => crate::tensor::gelu_tanh(&mut gate),
    }
    elementwise_mul(&mut gate, &up);

    // W1/W3 are output-sliced over hidden_dim, so this node's activation
    // chunk lands at its own offset in the reconstructed hidden vector.
    let off = block.w10_slice.d_index[slice_index];
    st.transformer.buffer.sliced_hb[off..off + d].copy_from_slice(&gate);
    Ok(())
}

/// Every active expert's slice, written into consecutive `hidden_dim`-wide
/// chunks of `sliced_hb` in router-rank order (matching the buffer's
/// `hidden_dim * n_active_experts` sizing). The gate weight is folded in
/// here rather than at merge time, since `ffn2`'s per-expert matmuls would
/// otherwise need to carry it through separately.
fn step_ffn_moe(st: &mut NodeState, slice_index: usize, n_threads: usize, thread_index: usize) -> Result<()> {
    // Every thread recomputes the same routing decision independently: it's
    // a small, deterministic, pure function of this layer's xb and the
    // (unsliced, replicated) router weights, so there is nothing to gain
    // from computing it once and broadcasting it across the barrier.
    select_moe_experts(st)?;

    let act_kind = st.spec.buffer_float_type;
    let hidden_act = st.spec.hidden_act;
    let input = unit_xb_bytes(st);
    let idx = st.current_block_index;
    let active = st.moe_active.clone();

    for (slot, &(expert_index, gate_weight)) in active.iter().enumerate() {
        let block = &st.transformer.blocks[idx];
        let expert = &block.moe_experts[expert_index];
        let n = expert.w1_slice.n;
        let d = expert.w1_slice.d_sliced[slice_index];

        let mut gate = vec![0.0f32; d];
        matmul(expert.w1_slice.float_type, act_kind, &mut gate, &input, &expert.w1, n, d, n_threads, thread_index)?;
        let mut up = vec![0.0f32; d];
        matmul(expert.w3_slice.float_type, act_kind, &mut up, &input, &expert.w3, n, d, n_threads, thread_index)?;

        match hidden_act {
            HiddenAct::Silu => silu(&mut gate),
            HiddenAct::Gelu => crate::tensor::gelu_tanh(&mut gate),
        }
        elementwise_mul(&mut gate, &up);
        for v in gate.iter_mut() {
            *v *= gate_weight;
        }

        // Each expert owns a `hidden_dim`-wide stride of the multi-expert
        // buffer; within that stride this node's own chunk still lands at
        // its own output-sliced offset, exactly as in the dense case.
        let expert_stride = st.spec.hidden_dim as usize;
        let offset = slot * expert_stride + expert.w1_slice.d_index[slice_index];
        st.transformer.buffer.sliced_hb[offset..offset + d].copy_from_slice(&gate);
    }
    Ok(())
}

pub fn step_quantize_ffn_a(st: &mut NodeState, n_threads: usize, thread_index: usize) -> Result<()> {
    if st.spec.buffer_float_type == FloatType::F32 {
        return Ok(());
    }
    let n = st.transformer.buffer.sliced_hb.len();
    crate::quant::quantize_row(&st.transformer.buffer.sliced_hb, &mut st.transformer.buffer.sliced_hb_q, n, st.spec.buffer_float_type, n_threads, thread_index)
}

/// This node's partial sum of `XB2 = W2·HB` (W2 is input-sliced, so every
/// node's result is a partial sum over its own input range that must be
/// reduced with every other node's partial on the way back to root).
pub fn step_ffn2(st: &mut NodeState, slice_index: usize, n_threads: usize, thread_index: usize) -> Result<()> {
    if st.spec.is_moe() {
        step_ffn2_moe(st, slice_index, n_threads, thread_index)
    } else {
        step_ffn2_dense(st, slice_index, n_threads, thread_index)
    }
}

/// `W2`'s input (the full `hidden_dim`-wide `hb`) must already be complete
/// on this node — unlike `unit_xb`, `hb` is itself output-sliced by `ffn`,
/// so it only becomes whole after the `syncFfnA`/`syncFfnB` gather+broadcast
/// pair runs. `W2` is then output-sliced over `dim` exactly like Q/K/V/Wo,
/// so this node's rows land at their own offset for the caller's gather to
/// concatenate, not summed.
fn step_ffn2_dense(st: &mut NodeState, slice_index: usize, n_threads: usize, thread_index: usize) -> Result<()> {
    let act_kind = st.spec.buffer_float_type;
    let input = sliced_hb_bytes(st);
    let idx = st.current_block_index;
    let block = &st.transformer.blocks[idx];
    let n = block.w20_slice.n;
    let d = block.w20_slice.d_sliced[slice_index];

    let mut partial = vec![0.0f32; d];
    matmul(block.w20_slice.float_type, act_kind, &mut partial, &input, &block.w20, n, d, n_threads, thread_index)?;
    let off = block.w20_slice.d_index[slice_index];
    st.transformer.buffer.sliced_xb2[off..off + d].copy_from_slice(&partial);
    Ok(())
}

/// Same output-slicing as the dense case, but run once per active expert
/// against the full per-expert `hb` chunk and summed locally — the gate
/// weight was already folded into `hb` during `ffn`, so the expert sum is
/// a plain accumulation before this node's slice goes out to be gathered.
fn step_ffn2_moe(st: &mut NodeState, slice_index: usize, n_threads: usize, thread_index: usize) -> Result<()> {
    let act_kind = st.spec.buffer_float_type;
    let idx = st.current_block_index;
    let hidden_dim = st.spec.hidden_dim as usize;
    let active = st.moe_active.clone();

    let block = &st.transformer.blocks[idx];
    let d = block.moe_experts[active[0].0].w2_slice.d_sliced[slice_index];
    let off = block.moe_experts[active[0].0].w2_slice.d_index[slice_index];

    let mut total = vec![0.0f32; d];
    for (slot, &(expert_index, _)) in active.iter().enumerate() {
        let block = &st.transformer.blocks[idx];
        let expert = &block.moe_experts[expert_index];
        let n = expert.w2_slice.n;
        let chunk = sliced_hb_chunk_bytes(st, slot, hidden_dim);

        let mut partial = vec![0.0f32; d];
        matmul(expert.w2_slice.float_type, act_kind, &mut partial, &chunk, &expert.w2, n, d, n_threads, thread_index)?;
        elementwise_add(&mut total, &partial);
    }
    st.transformer.buffer.sliced_xb2[off..off + d].copy_from_slice(&total);
    Ok(())
}

/// The byte slice covering one expert's full `hidden_dim`-wide chunk of
/// `sliced_hb` (the `slot`-th active expert's stride), read out of
/// whichever buffer (float or quantized) the wire dtype calls for.
fn sliced_hb_chunk_bytes(st: &NodeState, slot: usize, hidden_dim: usize) -> Vec<u8> {
    if st.spec.buffer_float_type == FloatType::F32 {
        f32_to_bytes(&st.transformer.buffer.sliced_hb[slot * hidden_dim..(slot + 1) * hidden_dim])
    } else {
        let row_bytes = st.spec.buffer_float_type.row_bytes(hidden_dim);
        let start = slot * row_bytes;
        st.transformer.buffer.sliced_hb_q[start..start + row_bytes].to_vec()
    }
}

pub fn step_quantize_ffn2(st: &mut NodeState, n_threads: usize, thread_index: usize) -> Result<()> {
    st.transformer.buffer.quantize_sliced_xb2(n_threads, thread_index)
}

/// Add the (already gathered, full-width) `XB2` into the residual stream.
pub fn step_merge_ffn2(st: &mut NodeState) {
    let len = st.transformer.x.len();
    let xb2 = st.transformer.buffer.sliced_xb2[..len].to_vec();
    elementwise_add(&mut st.transformer.x, &xb2);
}

/// Advance the layer cursor, wrapping to finalize at the end of the stack.
pub fn step_next_block(st: &mut NodeState) {
    st.current_block_index += 1;
    if st.current_block_index >= st.spec.n_layers as usize {
        st.current_block_index = 0;
        st.finalize = true;
    }
}

pub fn step_rms_final(st: &mut NodeState) {
    if st.finalize {
        st.rms_value = rms(&st.transformer.x, RMS_EPS);
    }
}

pub fn step_rms_final_norm(st: &mut NodeState, n_threads: usize, thread_index: usize) {
    if !st.finalize {
        return;
    }
    let weight = st.transformer.root.as_ref().expect("rmsFinal requires root weights").rms_final.clone();
    let x = st.transformer.x.clone();
    let rms_value = st.rms_value;
    rmsnorm_apply(&mut st.transformer.x, &x, &weight, rms_value, n_threads, thread_index);
}

/// `logits = wcls · x`. Returns whether this pass was a finalizing one.
pub fn step_finalize(st: &mut NodeState, n_threads: usize, thread_index: usize) -> Result<bool> {
    if !st.finalize {
        return Ok(false);
    }
    let weights_kind = st.spec.weights_float_type;
    let dim = st.spec.dim as usize;
    let vocab_size = st.spec.vocab_size as usize;
    let x_bytes = f32_to_bytes(&st.transformer.x);
    let wcls = st.transformer.root.as_ref().expect("finalize requires root weights").wcls.clone();
    let mut logits = std::mem::take(&mut st.transformer.logits);
    matmul(weights_kind, FloatType::F32, &mut logits, &x_bytes, &wcls, dim, vocab_size, n_threads, thread_index)?;
    st.transformer.logits = logits;
    st.finalize = false;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ArchType;

    fn tiny_spec(n_slices: u32) -> ModelSpec {
        ModelSpec {
            arch_type: ArchType::Llama2,
            dim: 32,
            hidden_dim: 64,
            n_layers: 1,
            n_heads: 4,
            n_kv_heads: 4,
            head_size: 8,
            kv_dim: 32,
            seq_len: 8,
            vocab_size: 16,
            n_experts: 0,
            n_active_experts: 0,
            hidden_act: HiddenAct::Silu,
            rope_theta: 10000.0,
            weights_float_type: FloatType::F32,
            buffer_float_type: FloatType::F32,
            n_slices,
            header_size: 0,
            file_size: 0,
        }
    }

    fn tiny_moe_spec(n_slices: u32) -> ModelSpec {
        ModelSpec {
            n_experts: 4,
            n_active_experts: 2,
            ..tiny_spec(n_slices)
        }
    }

    #[test]
    fn next_block_wraps_and_sets_finalize() {
        let spec = tiny_spec(1);
        let transformer = Transformer::new(&spec, 0);
        let ctx = TransformerContext::new(spec, transformer, None);
        let mut st = ctx.state.lock().unwrap();
        step_next_block(&mut st);
        assert_eq!(st.current_block_index, 0);
        assert!(st.finalize);
    }

    #[test]
    fn rms_att_computes_nonzero_rms_for_nonzero_input() {
        let spec = tiny_spec(1);
        let mut transformer = Transformer::new(&spec, 0);
        transformer.x.iter_mut().enumerate().for_each(|(i, v)| *v = i as f32 + 1.0);
        let ctx = TransformerContext::new(spec, transformer, None);
        let mut st = ctx.state.lock().unwrap();
        step_rms_att(&mut st);
        assert!(st.rms_value > 0.0);
    }

    #[test]
    fn rms_att_norm_uses_the_precomputed_reciprocal() {
        let spec = tiny_spec(1);
        let mut transformer = Transformer::new(&spec, 0);
        transformer.x.iter_mut().enumerate().for_each(|(i, v)| *v = i as f32 + 1.0);
        transformer.blocks[0].rms_att.iter_mut().for_each(|w| *w = 1.0);
        let ctx = TransformerContext::new(spec, transformer, None);
        let mut st = ctx.state.lock().unwrap();
        step_rms_att(&mut st);
        let inv_rms = st.rms_value;
        step_rms_att_norm(&mut st, 1, 0);
        let expected: Vec<f32> = st.transformer.x.iter().map(|&x| x * inv_rms).collect();
        assert_eq!(st.transformer.buffer.unit_xb, expected);
    }

    #[test]
    fn qkv_fills_every_sliced_row_across_a_single_slice() {
        let spec = tiny_spec(1);
        let transformer = Transformer::new(&spec, 0);
        let ctx = TransformerContext::new(spec, transformer, None);
        let mut st = ctx.state.lock().unwrap();
        step_qkv(&mut st, 0, 1, 0).unwrap();
        assert_eq!(st.transformer.buffer.sliced_q.len(), 32);
    }

    #[test]
    fn finalize_only_fires_once_finalize_flag_is_set() {
        let spec = tiny_spec(1);
        let transformer = Transformer::new(&spec, 0);
        let ctx = TransformerContext::new(spec, transformer, None);
        let mut st = ctx.state.lock().unwrap();
        assert!(!step_finalize(&mut st, 1, 0).unwrap());
        st.finalize = true;
        assert!(step_finalize(&mut st, 1, 0).unwrap());
        assert!(!st.finalize);
    }

    #[test]
    fn moe_ffn_selects_exactly_n_active_experts_and_fills_their_chunks() {
        let spec = tiny_moe_spec(1);
        let transformer = Transformer::new(&spec, 0);
        let ctx = TransformerContext::new(spec, transformer, None);
        let mut st = ctx.state.lock().unwrap();
        step_rms_att(&mut st);
        step_rms_att_norm(&mut st, 1, 0);
        step_ffn(&mut st, 0, 1, 0).unwrap();
        assert_eq!(st.moe_active.len(), 2);
        let gate_sum: f32 = st.moe_active.iter().map(|&(_, w)| w).sum();
        assert!((gate_sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn moe_ffn2_produces_a_full_width_partial_sum() {
        let spec = tiny_moe_spec(1);
        let transformer = Transformer::new(&spec, 0);
        let ctx = TransformerContext::new(spec, transformer, None);
        let mut st = ctx.state.lock().unwrap();
        step_rms_att(&mut st);
        step_rms_att_norm(&mut st, 1, 0);
        step_ffn(&mut st, 0, 1, 0).unwrap();
        step_ffn2(&mut st, 0, 1, 0).unwrap();
        assert!(st.transformer.buffer.sliced_xb2.len() >= st.spec.dim as usize);
    }
}
