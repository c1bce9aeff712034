//! A worker node's 17-step subset of the forward-pass task list. Workers
//! never touch the residual stream `x` or run attention/rmsnorm reductions
//! themselves — they receive already-normalized activations from root,
//! compute their own row-slice of each projection, and send the result
//! back. `peers` here is always a single-socket pool pointed at root.

use super::sync::{broadcast_missing_recv, gather_send, scatter_recv};
use super::{elem_to_wire_bytes, receive_unit_xb, sliced_hb_bytes, unit_xb_wire_len, NodeState, TransformerContext};
use crate::buffer::SlicedBuf;
use crate::scheduler::{Task, TaskKind, TaskOutcome};
use crate::spec::FloatType;
use shardllm_core::error::Result;

fn lock(ctx: &TransformerContext) -> std::sync::MutexGuard<'_, NodeState> {
    ctx.state.lock().expect("node state mutex poisoned")
}

fn handle(res: Result<()>) -> TaskOutcome {
    match res {
        Ok(()) => TaskOutcome::Continue,
        Err(err) => {
            tracing::error!(error = %err, "worker task failed");
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

fn slice_index(st: &NodeState) -> usize {
    st.transformer.slice_index
}

/// Receive root's normalized `unit_xb` (the counterpart of root's
/// `scatterRmsAtt`).
fn task_sync_rms_att(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let len = unit_xb_wire_len(&st);
    let Some(pool) = st.peers.as_mut() else {
        return TaskOutcome::Continue;
    };
    let mut bytes = vec![0u8; len];
    if let Err(err) = scatter_recv(pool, &mut bytes) {
        tracing::error!(error = %err, "sync_rms_att recv failed");
        return TaskOutcome::Stop;
    }
    receive_unit_xb(&mut st, &bytes);
    TaskOutcome::Continue
}

fn task_qkv(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    let mut st = lock(ctx);
    let idx = slice_index(&st);
    handle(super::step_qkv(&mut st, idx, n, t))
}

fn task_quantize_qkv(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_qkv(&mut lock(ctx), n, t))
}

/// Send this node's own Q/K/V row ranges back to root (the counterpart of
/// root's `gatherQkv`).
fn task_sync_qkv(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let idx = st.current_block_index;
    let si = slice_index(&st);
    let (q_off, q_len, k_off, k_len, v_off, v_len) = {
        let block = &st.transformer.blocks[idx];
        (
            block.q0_slice.d_index[si],
            block.q0_slice.d_sliced[si],
            block.k0_slice.d_index[si],
            block.k0_slice.d_sliced[si],
            block.v0_slice.d_index[si],
            block.v0_slice.d_sliced[si],
        )
    };
    let q = st.transformer.buffer.sliced_chunk_bytes(SlicedBuf::Q, q_off, q_len);
    let k = st.transformer.buffer.sliced_chunk_bytes(SlicedBuf::K, k_off, k_len);
    let v = st.transformer.buffer.sliced_chunk_bytes(SlicedBuf::V, v_off, v_len);
    let Some(pool) = st.peers.as_mut() else {
        return TaskOutcome::Continue;
    };
    let result = gather_send(pool, &q).and_then(|_| gather_send(pool, &k)).and_then(|_| gather_send(pool, &v));
    if let Err(err) = result {
        tracing::error!(error = %err, "sync_qkv send failed");
        return TaskOutcome::Stop;
    }
    TaskOutcome::Continue
}

/// Receive root's post-attention `unit_xb` (the counterpart of root's
/// `scatterMultiheadAtt`). Attention itself only ever runs on root, since
/// it needs the full gathered K/V cache.
fn task_sync_multihead_att(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let len = unit_xb_wire_len(&st);
    let Some(pool) = st.peers.as_mut() else {
        return TaskOutcome::Continue;
    };
    let mut bytes = vec![0u8; len];
    if let Err(err) = scatter_recv(pool, &mut bytes) {
        tracing::error!(error = %err, "sync_multihead_att recv failed");
        return TaskOutcome::Stop;
    }
    receive_unit_xb(&mut st, &bytes);
    TaskOutcome::Continue
}

fn task_att(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    let mut st = lock(ctx);
    let idx = slice_index(&st);
    handle(super::step_att(&mut st, idx, n, t))
}

fn task_quantize_att(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_att(&mut lock(ctx), n, t))
}

/// Send this node's own `Wo` row range back to root (the counterpart of
/// root's `gatherAtt`).
fn task_sync_att(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let idx = st.current_block_index;
    let si = slice_index(&st);
    let (off, len) = {
        let block = &st.transformer.blocks[idx];
        (block.wo0_slice.d_index[si], block.wo0_slice.d_sliced[si])
    };
    let xb2 = st.transformer.buffer.sliced_chunk_bytes(SlicedBuf::Xb2, off, len);
    let Some(pool) = st.peers.as_mut() else {
        return TaskOutcome::Continue;
    };
    if let Err(err) = gather_send(pool, &xb2) {
        tracing::error!(error = %err, "sync_att send failed");
        return TaskOutcome::Stop;
    }
    TaskOutcome::Continue
}

/// Receive root's normalized FFN input (the counterpart of root's
/// `scatterRmsFfn`).
fn task_sync_rms_ffn(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let len = unit_xb_wire_len(&st);
    let Some(pool) = st.peers.as_mut() else {
        return TaskOutcome::Continue;
    };
    let mut bytes = vec![0u8; len];
    if let Err(err) = scatter_recv(pool, &mut bytes) {
        tracing::error!(error = %err, "sync_rms_ffn recv failed");
        return TaskOutcome::Stop;
    }
    receive_unit_xb(&mut st, &bytes);
    TaskOutcome::Continue
}

fn task_ffn(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    let mut st = lock(ctx);
    let idx = slice_index(&st);
    handle(super::step_ffn(&mut st, idx, n, t))
}

fn task_quantize_ffn_a(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_ffn_a(&mut lock(ctx), n, t))
}

/// Send this node's own `hb` row range(s) to root, one per active expert
/// slot (the counterpart half of root's `syncFfnHb` gather phase).
fn task_sync_ffn_a(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let idx = st.current_block_index;
    let si = slice_index(&st);
    let hidden_dim = st.spec.hidden_dim as usize;
    let slots = n_slots(&st);
    let ft = st.spec.buffer_float_type;
    let stride_bytes = elem_to_wire_bytes(ft, hidden_dim);
    let (off, len) = {
        let block = &st.transformer.blocks[idx];
        (
            elem_to_wire_bytes(ft, block.w10_slice.d_index[si]),
            elem_to_wire_bytes(ft, block.w10_slice.d_sliced[si]),
        )
    };
    let bytes = sliced_hb_bytes(&st);
    let Some(pool) = st.peers.as_mut() else {
        return TaskOutcome::Continue;
    };
    for slot in 0..slots {
        let base = slot * stride_bytes;
        if let Err(err) = gather_send(pool, &bytes[base + off..base + off + len]) {
            tracing::error!(error = %err, "sync_ffn_a send failed");
            return TaskOutcome::Stop;
        }
    }
    TaskOutcome::Continue
}

/// Receive the full `hb` (root's own chunk plus every other worker's
/// chunk) for every active expert slot (the counterpart of root's
/// `syncFfnHb` broadcast phase).
fn task_sync_ffn_b(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let idx = st.current_block_index;
    let si = slice_index(&st);
    let hidden_dim = st.spec.hidden_dim as usize;
    let slots = n_slots(&st);
    let ft = st.spec.buffer_float_type;
    let stride_bytes = elem_to_wire_bytes(ft, hidden_dim);
    let (off, len) = {
        let block = &st.transformer.blocks[idx];
        (
            elem_to_wire_bytes(ft, block.w10_slice.d_index[si]),
            elem_to_wire_bytes(ft, block.w10_slice.d_sliced[si]),
        )
    };
    let n_slices = st.spec.n_slices as usize;
    let mut bytes = vec![0u8; stride_bytes * slots];
    {
        let Some(pool) = st.peers.as_mut() else {
            return TaskOutcome::Continue;
        };
        for slot in 0..slots {
            let base = slot * stride_bytes;
            // Every slice but this worker's own (root's slice 0 plus every
            // other worker) arrives here, in ascending slice-index order —
            // the same order `broadcast_missing` on root writes them in.
            let mut missing: Vec<(usize, usize)> = Vec::with_capacity(n_slices - 1);
            missing.push((base, off));
            let after_off = off + len;
            let after_len = stride_bytes - after_off;
            if after_len > 0 {
                missing.push((base + after_off, after_len));
            }
            if let Err(err) = broadcast_missing_recv(pool, &mut bytes, &missing) {
                tracing::error!(error = %err, "sync_ffn_b recv failed");
                return TaskOutcome::Stop;
            }
        }
    }
    // `bytes`'s own-chunk range was never written above (it's skipped in
    // both loops below); `sliced_hb`/`sliced_hb_q` already hold it from
    // this node's own `ffn` step, so only the received ranges get copied in.
    if ft == FloatType::F32 {
        for slot in 0..slots {
            let base = slot * stride_bytes / 4;
            let stride_f32 = stride_bytes / 4;
            for i in 0..stride_f32 {
                if i * 4 >= off && i * 4 < off + len {
                    continue;
                }
                let byte_off = slot * stride_bytes + i * 4;
                let c = &bytes[byte_off..byte_off + 4];
                st.transformer.buffer.sliced_hb[base + i] = f32::from_le_bytes(c.try_into().unwrap());
            }
        }
    } else {
        for slot in 0..slots {
            let base = slot * stride_bytes;
            for i in 0..stride_bytes {
                if i >= off && i < off + len {
                    continue;
                }
                st.transformer.buffer.sliced_hb_q[base + i] = bytes[base + i];
            }
        }
    }
    TaskOutcome::Continue
}

fn task_ffn2(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    let mut st = lock(ctx);
    let idx = slice_index(&st);
    handle(super::step_ffn2(&mut st, idx, n, t))
}

fn task_quantize_ffn2(n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    handle(super::step_quantize_ffn2(&mut lock(ctx), n, t))
}

/// Send this node's own output-sliced `xb2` row range back to root (the
/// counterpart of root's `gatherFfn2`).
fn task_sync_ffn2(_n: usize, t: usize, ctx: &TransformerContext) -> TaskOutcome {
    if t != 0 {
        return TaskOutcome::Continue;
    }
    let mut st = lock(ctx);
    let idx = st.current_block_index;
    let si = slice_index(&st);
    let (off, len) = {
        let block = &st.transformer.blocks[idx];
        (block.w20_slice.d_index[si], block.w20_slice.d_sliced[si])
    };
    let xb2 = st.transformer.buffer.sliced_chunk_bytes(SlicedBuf::Xb2, off, len);
    let Some(pool) = st.peers.as_mut() else {
        return TaskOutcome::Continue;
    };
    if let Err(err) = gather_send(pool, &xb2) {
        tracing::error!(error = %err, "sync_ffn2 send failed");
        return TaskOutcome::Stop;
    }
    TaskOutcome::Continue
}

/// The last task in a worker's list, and its only source of `Stop`: a
/// worker has no `finalize` task of its own, so it reads the same wrap
/// signal `step_next_block` sets for root and uses it to end its own
/// restart-from-0 cycle in lockstep with root's.
fn task_next_block(_n: usize, _t: usize, ctx: &TransformerContext) -> TaskOutcome {
    let mut st = lock(ctx);
    super::step_next_block(&mut st);
    if st.finalize {
        st.finalize = false;
        return TaskOutcome::Stop;
    }
    TaskOutcome::Continue
}

/// Build the worker node's ordered forward-pass task list.
pub fn build() -> Vec<Task<TransformerContext>> {
    use TaskKind::{Compute, Transfer};
    vec![
        Task { name: "syncRmsAtt", kind: Transfer, run: task_sync_rms_att },
        Task { name: "qkv", kind: Compute, run: task_qkv },
        Task { name: "quantizeQkv", kind: Compute, run: task_quantize_qkv },
        Task { name: "syncQkv", kind: Transfer, run: task_sync_qkv },
        Task { name: "syncMultiheadAtt", kind: Transfer, run: task_sync_multihead_att },
        Task { name: "att", kind: Compute, run: task_att },
        Task { name: "quantizeAtt", kind: Compute, run: task_quantize_att },
        Task { name: "syncAtt", kind: Transfer, run: task_sync_att },
        Task { name: "syncRmsFfn", kind: Transfer, run: task_sync_rms_ffn },
        Task { name: "ffn", kind: Compute, run: task_ffn },
        Task { name: "quantizeFfnA", kind: Compute, run: task_quantize_ffn_a },
        Task { name: "syncFfnA", kind: Transfer, run: task_sync_ffn_a },
        Task { name: "syncFfnB", kind: Transfer, run: task_sync_ffn_b },
        Task { name: "ffn2", kind: Compute, run: task_ffn2 },
        Task { name: "quantizeFfn2", kind: Compute, run: task_quantize_ffn2 },
        Task { name: "syncFfn2", kind: Transfer, run: task_sync_ffn2 },
        Task { name: "nextBlock", kind: Compute, run: task_next_block },
    ]
}
