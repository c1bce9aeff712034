//! Model file loading and the root→worker bootstrap handshake.
//!
//! Root mmaps the weights file, parses the header into a `ModelSpec`,
//! sends every worker its slice index and the full spec over a fresh
//! connection, then streams every layer's weights in canonical order —
//! sliced projections go out row-range by row-range (root keeps slice 0,
//! each worker gets its own slice written to its socket), replicated
//! tensors (embeddings, RMS factors, classifier head, MoE router) go to
//! whichever nodes need them without slicing.
//!
//! Workers mirror the same canonical order on read, since `Socket::read`
//! blocks until exactly the requested number of bytes has arrived
//! regardless of how root's writes were chunked on the wire.

use crate::slice::MatmulSlice;
use crate::spec::{ArchType, FloatType, ModelSpec};
use crate::transformer::{Transformer, TransformerBlock};
use crate::transport::{Socket, SocketPool};
use memmap2::Mmap;
use shardllm_core::error::{Result, ShardLlmError};
use std::fs::File;
use std::io::Cursor;
use std::path::Path;

/// Everything root needs to start the forward-pass task loop.
pub struct RootBootstrap {
    pub spec: ModelSpec,
    pub transformer: Transformer,
    pub pool: SocketPool,
}

/// Everything a worker needs to start the forward-pass task loop.
pub struct WorkerBootstrap {
    pub spec: ModelSpec,
    pub transformer: Transformer,
    pub pool: SocketPool,
}

/// Copy `len` bytes at `*cursor` out of `data`, advancing the cursor.
fn take<'a>(data: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *cursor + len;
    if end > data.len() {
        return Err(ShardLlmError::CorruptWeightsFile(format!(
            "weights file truncated: needed {len} bytes at offset {cursor}, file has {}",
            data.len()
        )));
    }
    let out = &data[*cursor..end];
    *cursor = end;
    Ok(out)
}

/// Split one projection's full row range out of `data` at `*cursor` and
/// distribute it: slice 0's rows are copied into `local`, every other
/// slice's rows are written straight to its worker socket. Returns the
/// number of bytes consumed, which always equals `slice.bytes()`.
fn stream_sliced(pool: &mut SocketPool, slice: &MatmulSlice, data: &[u8], cursor: &mut usize, local: &mut [u8]) -> Result<usize> {
    let full = take(data, cursor, slice.bytes())?;
    for slice_index in 0..slice.n_slices {
        let len = slice.slice_bytes(slice_index);
        let mut piece = vec![0u8; len];
        slice.split_weights(slice_index, full, &mut piece);
        if slice_index == 0 {
            local.copy_from_slice(&piece);
        } else {
            pool.write(slice_index - 1, &piece)?;
        }
    }
    Ok(slice.bytes())
}

/// Copy a root-only (never sliced, never sent over the wire) tensor.
fn stream_root_only(data: &[u8], cursor: &mut usize, dst: &mut [u8]) -> Result<usize> {
    let bytes = take(data, cursor, dst.len())?;
    dst.copy_from_slice(bytes);
    Ok(dst.len())
}

/// Copy a replicated (never sliced, but sent to every node) tensor — the
/// MoE router, which every node needs in full to compute the same routing
/// decision independently without a synchronization step.
fn stream_replicated(pool: &mut SocketPool, data: &[u8], cursor: &mut usize, local: &mut [u8]) -> Result<usize> {
    let bytes = take(data, cursor, local.len())?.to_vec();
    local.copy_from_slice(&bytes);
    for i in 0..pool.len() {
        pool.write(i, &bytes)?;
    }
    Ok(local.len())
}

/// Root-only f32 tensor (RMS factors, final norm): read raw little-endian
/// floats directly into the target `Vec<f32>`.
fn stream_root_only_f32(data: &[u8], cursor: &mut usize, dst: &mut [f32]) -> Result<usize> {
    let bytes = take(data, cursor, dst.len() * 4)?;
    for (i, c) in bytes.chunks_exact(4).enumerate() {
        dst[i] = f32::from_le_bytes(c.try_into().unwrap());
    }
    Ok(bytes.len())
}

/// Root mmaps `model_path`, parses its header, connects to every worker
/// endpoint, runs the handshake and streams every layer's weights in
/// canonical order. Fails with `CorruptWeightsFile` if the file doesn't
/// contain exactly `header_size + sum-of-every-tensor-declared-by-spec`
/// bytes.
pub fn load_root_from_file(
    model_path: &Path,
    weights_float_type: FloatType,
    buffer_float_type: FloatType,
    n_slices: usize,
    worker_addrs: &[String],
) -> Result<RootBootstrap> {
    if worker_addrs.len() != n_slices - 1 {
        return Err(ShardLlmError::InvalidShape(format!(
            "expected {} worker addresses for n_slices={n_slices}, got {}",
            n_slices - 1,
            worker_addrs.len()
        )));
    }

    let file = File::open(model_path)?;
    let file_size = file.metadata()?.len();
    let mmap = unsafe { Mmap::map(&file) }.map_err(ShardLlmError::Io)?;

    let mut header_cursor = Cursor::new(&mmap[..]);
    let spec = ModelSpec::parse_header(&mut header_cursor, weights_float_type, buffer_float_type, n_slices as u32, file_size)?;

    let mut pool = SocketPool::connect(worker_addrs)?;
    let mut spec_bytes = Vec::new();
    spec.write_wire(&mut spec_bytes)?;
    for (i, _) in worker_addrs.iter().enumerate() {
        let slice_index = (i + 1) as u8;
        pool.write(i, &[slice_index])?;
        pool.write(i, &spec_bytes)?;
    }

    let weights = &mmap[spec.header_size as usize..];
    let mut cursor = 0usize;
    let mut transformer = Transformer::new(&spec, 0);

    {
        let root = transformer.root.as_mut().expect("root bootstrap always builds root weights");
        stream_root_only(weights, &mut cursor, &mut root.token_embedding_table)?;
    }

    for layer in 0..spec.n_layers as usize {
        load_layer(&spec, &mut pool, weights, &mut cursor, &mut transformer.blocks[layer])?;
    }

    {
        let root = transformer.root.as_mut().unwrap();
        stream_root_only(weights, &mut cursor, &mut root.wcls)?;
    }
    {
        let root = transformer.root.as_mut().unwrap();
        stream_root_only_f32(weights, &mut cursor, &mut root.rms_final)?;
    }

    let consumed = cursor as u64;
    let expected = file_size - spec.header_size;
    if consumed != expected {
        return Err(ShardLlmError::CorruptWeightsFile(format!(
            "weight stream consumed {consumed} bytes, expected {expected}"
        )));
    }

    Ok(RootBootstrap { spec, transformer, pool })
}

fn load_layer(spec: &ModelSpec, pool: &mut SocketPool, weights: &[u8], cursor: &mut usize, block: &mut TransformerBlock) -> Result<()> {
    stream_sliced(pool, &block.q0_slice.clone(), weights, cursor, &mut block.q0)?;
    stream_sliced(pool, &block.k0_slice.clone(), weights, cursor, &mut block.k0)?;
    stream_sliced(pool, &block.v0_slice.clone(), weights, cursor, &mut block.v0)?;
    stream_sliced(pool, &block.wo0_slice.clone(), weights, cursor, &mut block.wo0)?;

    if spec.is_moe() {
        stream_replicated(pool, weights, cursor, &mut block.moe_router)?;
        for expert in block.moe_experts.iter_mut() {
            // File order is per-expert (up, gate, down); this crate's FFN
            // naming mirrors the dense W1/W2/W3 convention instead (w1 =
            // gate, activated; w2 = down; w3 = up, unactivated), so the
            // wire order here is w3, w1, w2.
            stream_sliced(pool, &expert.w3_slice.clone(), weights, cursor, &mut expert.w3)?;
            stream_sliced(pool, &expert.w1_slice.clone(), weights, cursor, &mut expert.w1)?;
            stream_sliced(pool, &expert.w2_slice.clone(), weights, cursor, &mut expert.w2)?;
        }
    } else {
        stream_sliced(pool, &block.w10_slice.clone(), weights, cursor, &mut block.w10)?;
        stream_sliced(pool, &block.w20_slice.clone(), weights, cursor, &mut block.w20)?;
        stream_sliced(pool, &block.w30_slice.clone(), weights, cursor, &mut block.w30)?;
    }

    stream_root_only_f32(weights, cursor, &mut block.rms_att)?;
    stream_root_only_f32(weights, cursor, &mut block.rms_ffn)?;
    if spec.arch_type == ArchType::Grok1 {
        stream_root_only_f32(weights, cursor, block.rms_moe.as_mut().expect("grok1 block always has rms_moe"))?;
        stream_root_only_f32(weights, cursor, block.rms_ffn2.as_mut().expect("grok1 block always has rms_ffn2"))?;
    }
    Ok(())
}

/// Worker side: read its slice index and the broadcast spec off its single
/// socket to root, then read its own row range of every layer's weights in
/// the same canonical order root streamed them in.
pub fn load_worker(root_socket: Socket) -> Result<WorkerBootstrap> {
    let mut pool = SocketPool::from_sockets(vec![root_socket]);

    let mut slice_index_byte = [0u8; 1];
    pool.read(0, &mut slice_index_byte)?;
    let slice_index = slice_index_byte[0] as usize;

    let spec = read_spec_from_socket(&mut pool)?;
    let mut transformer = Transformer::new(&spec, slice_index);

    for layer in 0..spec.n_layers as usize {
        load_layer_slice(&spec, slice_index, &mut pool, &mut transformer.blocks[layer])?;
    }

    Ok(WorkerBootstrap { spec, transformer, pool })
}

fn read_spec_from_socket(pool: &mut SocketPool) -> Result<ModelSpec> {
    // The wire encoding is fixed-width (see `ModelSpec::write_wire`): 16
    // u32 fields, one f32, and two u64 fields.
    const WIRE_LEN: usize = 16 * 4 + 4 + 2 * 8;
    let mut bytes = vec![0u8; WIRE_LEN];
    pool.read(0, &mut bytes)?;
    let mut cursor = Cursor::new(bytes);
    ModelSpec::read_wire(&mut cursor)
}

fn recv_sliced(pool: &mut SocketPool, slice: &MatmulSlice, slice_index: usize, dst: &mut [u8]) -> Result<()> {
    debug_assert_eq!(dst.len(), slice.slice_bytes(slice_index));
    pool.read(0, dst)
}

fn load_layer_slice(spec: &ModelSpec, slice_index: usize, pool: &mut SocketPool, block: &mut TransformerBlock) -> Result<()> {
    recv_sliced(pool, &block.q0_slice.clone(), slice_index, &mut block.q0)?;
    recv_sliced(pool, &block.k0_slice.clone(), slice_index, &mut block.k0)?;
    recv_sliced(pool, &block.v0_slice.clone(), slice_index, &mut block.v0)?;
    recv_sliced(pool, &block.wo0_slice.clone(), slice_index, &mut block.wo0)?;

    if spec.is_moe() {
        pool.read(0, &mut block.moe_router)?;
        for expert in block.moe_experts.iter_mut() {
            recv_sliced(pool, &expert.w3_slice.clone(), slice_index, &mut expert.w3)?;
            recv_sliced(pool, &expert.w1_slice.clone(), slice_index, &mut expert.w1)?;
            recv_sliced(pool, &expert.w2_slice.clone(), slice_index, &mut expert.w2)?;
        }
    } else {
        recv_sliced(pool, &block.w10_slice.clone(), slice_index, &mut block.w10)?;
        recv_sliced(pool, &block.w20_slice.clone(), slice_index, &mut block.w20)?;
        recv_sliced(pool, &block.w30_slice.clone(), slice_index, &mut block.w30)?;
    }
    Ok(())
}
