//! The root node's ordered task list: every dense/MoE compute step plus
//! the transfer steps that scatter input to workers and gather/broadcast
//! their contributions back. Root is always slice index 0.

use super::sync::{broadcast_missing, gather, scatter};
use super::{
    elem_to_wire_bytes, f32_to_bytes, relative_to_worker_region, sliced_hb_bytes, unit_xb_bytes, worker_byte_offsets, NodeState,
    TransformerContext,
};
use crate::buffer::SlicedBuf;
use crate::scheduler::{Task, TaskKind, TaskOutcome};
use crate::slice::MatmulSlice;
use crate::spec::FloatType;
use shardllm_core::error::Result;

const SLICE_INDEX: usize = 0;

fn lock(ctx: &TransformerContext) -> std::sync::MutexGuard<'_, NodeState> {
    ctx.state.lock().expect("node state mutex poisoned")
}

fn handle(res: Result<()>) -> TaskOutcome {
    match res {
        Ok(()) => TaskOutcome::Continue,
        Err(err) => {
            tracing::error!(error = %err, "root task failed");
            TaskOutcome::Stop
        }
    }
}

fn n_slots(st: &NodeState) -> usize {
    if st.spec.is_moe() {
        st.spec.n_active_experts as usize
    } else {
        1
    }
}

fn task_rms_att(_n: usize, _t: usize, ctx: &TransformerContext) -> TaskOutcome {
    super::step_rms_att(&mut lock(ctx));
    TaskOutcome::Continue
}

fn task_rms_att_norm(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    super::step_rms_att_norm(&mut lock(ctx), n, t);
    TaskOutcome::Continue
}

fn task_quantize_rms_att(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_rms_att(&mut lock(ctx), n, t))
}

/// Scatter the normalized (and, if needed, quantized) unit activation to
/// every worker so they can compute their own Q/K/V/FFN row ranges.
fn task_scatter_rms_att(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let payload = unit_xb_bytes(&st);
    match st.peers.as_mut() {
        Some(pool) => handle(scatter(pool, &payload)),
        None => TaskOutcome::Continue,
    }
}

fn task_qkv(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_qkv(&mut lock(ctx), SLICE_INDEX, n, t))
}

fn task_quantize_qkv(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_qkv(&mut lock(ctx), n, t))
}

/// Gather one projection's worker row ranges into their offsets of the
/// full-width buffer. `sync::gather` expects its buffer argument to start
/// exactly at the first worker's own data, so we hand it the tail of
/// `full` past root's own chunk, with offsets re-zeroed to match.
fn gather_into(pool: &mut crate::transport::SocketPool, full: &mut [f32], absolute: &[(usize, usize)]) -> Result<()> {
    if absolute.is_empty() {
        return Ok(());
    }
    debug_assert!(absolute[0].0 % 4 == 0);
    let base = absolute[0].0 / 4;
    let relative = relative_to_worker_region(absolute);
    let mut bytes = f32_to_bytes(&full[base..]);
    gather(pool, &mut bytes, &relative)?;
    for (i, c) in bytes.chunks_exact(4).enumerate() {
        full[base + i] = f32::from_le_bytes(c.try_into().unwrap());
    }
    Ok(())
}

fn sliced_buf_f32_mut(st: &mut NodeState, which: SlicedBuf) -> &mut [f32] {
    match which {
        SlicedBuf::Q => &mut st.transformer.buffer.sliced_q,
        SlicedBuf::K => &mut st.transformer.buffer.sliced_k,
        SlicedBuf::V => &mut st.transformer.buffer.sliced_v,
        SlicedBuf::Xb2 => &mut st.transformer.buffer.sliced_xb2,
    }
}

fn sliced_buf_q_mut(st: &mut NodeState, which: SlicedBuf) -> &mut [u8] {
    match which {
        SlicedBuf::Q => &mut st.transformer.buffer.sliced_q_q,
        SlicedBuf::K => &mut st.transformer.buffer.sliced_k_q,
        SlicedBuf::V => &mut st.transformer.buffer.sliced_v_q,
        SlicedBuf::Xb2 => &mut st.transformer.buffer.sliced_xb2_q,
    }
}

/// Gather every worker's row range of a sliced buffer into its full-width
/// form, honoring the wire dtype. For F32 the worker bytes land directly in
/// the f32 buffer, exactly like `gather_into`. For a quantized wire type the
/// worker bytes land in the `_q` twin first, then get dequantized back into
/// the f32 mirror row by row — every downstream consumer of Q/K/V/attention
/// output reads the f32 buffer directly, so it must stay in sync.
fn gather_sliced(pool: &mut crate::transport::SocketPool, st: &mut NodeState, which: SlicedBuf, slice: &MatmulSlice) -> Result<()> {
    let ft = st.spec.buffer_float_type;
    let absolute = worker_byte_offsets(slice, ft);
    if absolute.is_empty() {
        return Ok(());
    }
    let relative = relative_to_worker_region(&absolute);
    let base_bytes = absolute[0].0;

    if ft == FloatType::F32 {
        let full = sliced_buf_f32_mut(st, which);
        gather_into(pool, full, &absolute)?;
        return Ok(());
    }

    let full_q = sliced_buf_q_mut(st, which);
    let mut bytes = full_q[base_bytes..].to_vec();
    gather(pool, &mut bytes, &relative)?;
    full_q[base_bytes..].copy_from_slice(&bytes);

    for i in 1..slice.n_slices {
        let (elem_off, elem_len) = (slice.d_index[i], slice.d_sliced[i]);
        st.transformer.buffer.dequantize_sliced_range(which, elem_off, elem_len, 1, 0)?;
    }
    Ok(())
}

/// Gather every worker's Q/K/V row range into the full-width buffers.
fn task_gather_qkv(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let idx = st.current_block_index;
    let (q_slice, k_slice, v_slice) = {
        let block = &st.transformer.blocks[idx];
        (block.q0_slice.clone(), block.k0_slice.clone(), block.v0_slice.clone())
    };
    let Some(mut pool) = st.peers.take() else {
        return TaskOutcome::Continue;
    };
    let result = gather_sliced(&mut pool, &mut st, SlicedBuf::Q, &q_slice)
        .and_then(|_| gather_sliced(&mut pool, &mut st, SlicedBuf::K, &k_slice))
        .and_then(|_| gather_sliced(&mut pool, &mut st, SlicedBuf::V, &v_slice));
    st.peers = Some(pool);
    if let Err(err) = result {
        tracing::error!(error = %err, "gather_qkv failed");
        return TaskOutcome::Stop;
    }
    TaskOutcome::Continue
}

fn task_multihead_att(_n: usize, _t: usize, ctx: &TransformerContext) -> TaskOutcome {
    super::step_multihead_att(&mut lock(ctx));
    TaskOutcome::Continue
}

fn task_quantize_multihead_att(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_multihead_att(&mut lock(ctx), n, t))
}

/// Scatter the attention output (now sitting in `unit_xb`) so every worker
/// can compute its own slice of `Wo`.
fn task_scatter_multihead_att(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let payload = unit_xb_bytes(&st);
    match st.peers.as_mut() {
        Some(pool) => handle(scatter(pool, &payload)),
        None => TaskOutcome::Continue,
    }
}

fn task_att(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_att(&mut lock(ctx), SLICE_INDEX, n, t))
}

fn task_quantize_att(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_att(&mut lock(ctx), n, t))
}

/// Gather every worker's `Wo` row range into the reconstructed `xb2`.
fn task_gather_att(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let idx = st.current_block_index;
    let wo0_slice = st.transformer.blocks[idx].wo0_slice.clone();
    let Some(mut pool) = st.peers.take() else {
        return TaskOutcome::Continue;
    };
    let result = gather_sliced(&mut pool, &mut st, SlicedBuf::Xb2, &wo0_slice);
    st.peers = Some(pool);
    if let Err(err) = result {
        tracing::error!(error = %err, "gather_att failed");
        return TaskOutcome::Stop;
    }
    TaskOutcome::Continue
}

fn task_residual_att(_n: usize, _t: usize, ctx: &TransformerContext) -> TaskOutcome {
    super::step_residual_att(&mut lock(ctx));
    TaskOutcome::Continue
}

fn task_rms_ffn(_n: usize, _t: usize, ctx: &TransformerContext) -> TaskOutcome {
    super::step_rms_ffn(&mut lock(ctx));
    TaskOutcome::Continue
}

fn task_rms_ffn_norm(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    super::step_rms_ffn_norm(&mut lock(ctx), n, t);
    TaskOutcome::Continue
}

fn task_quantize_rms_ffn(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_rms_ffn(&mut lock(ctx), n, t))
}

fn task_scatter_rms_ffn(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let payload = unit_xb_bytes(&st);
    match st.peers.as_mut() {
        Some(pool) => handle(scatter(pool, &payload)),
        None => TaskOutcome::Continue,
    }
}

fn task_ffn(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_ffn(&mut lock(ctx), SLICE_INDEX, n, t))
}

fn task_quantize_ffn_a(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_ffn_a(&mut lock(ctx), n, t))
}

/// `hb` is itself output-sliced by `ffn`, so — unlike `unit_xb` — it must be
/// gathered into one complete copy and then broadcast back out: every node
/// (including this one) needs the full `hb` as `W2`'s input.
///
/// Each active expert owns its own `hidden_dim`-wide stride of `sliced_hb`
/// (dense models have exactly one such stride), so the gather+relay runs
/// once per stride, each using the dense `w10_slice` row-range layout since
/// every expert's chunk is sliced identically to the dense FFN.
fn task_sync_ffn_hb(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let idx = st.current_block_index;
    let hidden_dim = st.spec.hidden_dim as usize;
    let slots = n_slots(&st);
    let ft = st.spec.buffer_float_type;
    let stride_bytes = elem_to_wire_bytes(ft, hidden_dim);
    let w10_slice = st.transformer.blocks[idx].w10_slice.clone();
    let absolute = worker_byte_offsets(&w10_slice, ft);
    let root_chunk_len = absolute.first().map(|&(o, _)| o).unwrap_or(0);
    let Some(pool) = st.peers.as_mut() else {
        return TaskOutcome::Continue;
    };
    let mut bytes = sliced_hb_bytes(&st);
    for slot in 0..slots {
        let base = slot * stride_bytes;
        let relative = relative_to_worker_region(&absolute);
        if let Err(err) = gather(pool, &mut bytes[base + root_chunk_len..base + stride_bytes], &relative) {
            tracing::error!(error = %err, "gather_ffn_hb failed");
            return TaskOutcome::Stop;
        }
        // `broadcast_missing` only relays worker-owned slices to other
        // workers; root's own chunk (slice 0) has no counterpart there, so
        // it's sent explicitly here first.
        for dst in 0..pool.len() {
            if let Err(err) = pool.write(dst, &bytes[base..base + root_chunk_len]) {
                tracing::error!(error = %err, "broadcast root hb chunk failed");
                return TaskOutcome::Stop;
            }
        }
        let stride_offsets: Vec<(usize, usize)> = absolute.iter().map(|&(o, l)| (base + o, l)).collect();
        if let Err(err) = broadcast_missing(pool, &bytes, &stride_offsets) {
            tracing::error!(error = %err, "broadcast_ffn_hb failed");
            return TaskOutcome::Stop;
        }
    }
    if ft == FloatType::F32 {
        for (i, c) in bytes.chunks_exact(4).enumerate() {
            st.transformer.buffer.sliced_hb[i] = f32::from_le_bytes(c.try_into().unwrap());
        }
    } else {
        st.transformer.buffer.sliced_hb_q.copy_from_slice(&bytes);
    }
    TaskOutcome::Continue
}

fn task_ffn2(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_ffn2(&mut lock(ctx), SLICE_INDEX, n, t))
}

fn task_quantize_ffn2(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_ffn2(&mut lock(ctx), n, t))
}

/// Gather every worker's output-sliced `xb2` row range (W2's projection).
fn task_gather_ffn2(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let idx = st.current_block_index;
    let w20_slice = st.transformer.blocks[idx].w20_slice.clone();
    let Some(mut pool) = st.peers.take() else {
        return TaskOutcome::Continue;
    };
    let result = gather_sliced(&mut pool, &mut st, SlicedBuf::Xb2, &w20_slice);
    st.peers = Some(pool);
    if let Err(err) = result {
        tracing::error!(error = %err, "gather_ffn2 failed");
        return TaskOutcome::Stop;
    }
    TaskOutcome::Continue
}

fn task_merge_ffn2(_n: usize, _t: usize, ctx: &TransformerContext) -> TaskOutcome {
    super::step_merge_ffn2(&mut lock(ctx));
    TaskOutcome::Continue
}

fn task_next_block(_n: usize, _t: usize, ctx: &TransformerContext) -> TaskOutcome {
    super::step_next_block(&mut lock(ctx));
    TaskOutcome::Continue
}

fn task_rms_final(_n: usize, _t: usize, ctx: &TransformerContext) -> TaskOutcome {
    super::step_rms_final(&mut lock(ctx));
    TaskOutcome::Continue
}

fn task_rms_final_norm(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    super::step_rms_final_norm(&mut lock(ctx), n, t);
    TaskOutcome::Continue
}

/// The last task in the list. Every other task returns `Continue`; this one
/// is the sole source of `Stop`, which is what ends a `TaskLoop::run`'s
/// restart-from-0 cycle — one cycle per token, exactly when `step_finalize`
/// actually produced logits rather than skipping a non-final layer.
fn task_finalize(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    match super::step_finalize(&mut lock(ctx), n, t) {
        Ok(true) => TaskOutcome::Stop,
        Ok(false) => TaskOutcome::Continue,
        Err(err) => {
            tracing::error!(error = %err, "finalize failed");
            TaskOutcome::Stop
        }
    }
}

/// Build the root node's ordered forward-pass task list.
pub fn build() -> Vec<Task<TransformerContext>> {
    use TaskKind::{Compute, Transfer};
    vec![
        Task { name: "rmsAtt", kind: Compute, run: task_rms_att },
        Task { name: "rmsAttNorm", kind: Compute, run: task_rms_att_norm },
        Task { name: "quantizeRmsAtt", kind: Compute, run: task_quantize_rms_att },
        Task { name: "scatterRmsAtt", kind: Transfer, run: task_scatter_rms_att },
        Task { name: "qkv", kind: Compute, run: task_qkv },
        Task { name: "quantizeQkv", kind: Compute, run: task_quantize_qkv },
        Task { name: "gatherQkv", kind: Transfer, run: task_gather_qkv },
        Task { name: "multiheadAtt", kind: Compute, run: task_multihead_att },
        Task { name: "quantizeMultiheadAtt", kind: Compute, run: task_quantize_multihead_att },
        Task { name: "scatterMultiheadAtt", kind: Transfer, run: task_scatter_multihead_att },
        Task { name: "att", kind: Compute, run: task_att },
        Task { name: "quantizeAtt", kind: Compute, run: task_quantize_att },
        Task { name: "gatherAtt", kind: Transfer, run: task_gather_att },
        Task { name: "residualAtt", kind: Compute, run: task_residual_att },
        Task { name: "rmsFfn", kind: Compute, run: task_rms_ffn },
        Task { name: "rmsFfnNorm", kind: Compute, run: task_rms_ffn_norm },
        Task { name: "quantizeRmsFfn", kind: Compute, run: task_quantize_rms_ffn },
        Task { name: "scatterRmsFfn", kind: Transfer, run: task_scatter_rms_ffn },
        Task { name: "ffn", kind: Compute, run: task_ffn },
        Task { name: "quantizeFfnA", kind: Compute, run: task_quantize_ffn_a },
        Task { name: "syncFfnHb", kind: Transfer, run: task_sync_ffn_hb },
        Task { name: "ffn2", kind: Compute, run: task_ffn2 },
        Task { name: "quantizeFfn2", kind: Compute, run: task_quantize_ffn2 },
        Task { name: "gatherFfn2", kind: Transfer, run: task_gather_ffn2 },
        Task { name: "mergeFfn2", kind: Compute, run: task_merge_ffn2 },
        Task { name: "nextBlock", kind: Compute, run: task_next_block },
        Task { name: "rmsFinal", kind: Compute, run: task_rms_final },
        Task { name: "rmsFinalNorm", kind: Compute, run: task_rms_final_norm },
        Task { name: "finalize", kind: Compute, run: task_finalize },
    ]
}
