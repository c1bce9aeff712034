//! Root-side sync primitives shared by every task that crosses the wire:
//! `scatter` (unit buffer to every worker), `gather` (each worker's own
//! slice back to root) and `broadcast_missing` (fill in each worker's
//! holes so every node ends up with the full sliced buffer).

use crate::transport::{SocketIo, SocketPool};
use shardllm_core::error::Result;

/// Root: write `data` (a whole unit buffer) to every worker socket.
pub fn scatter(pool: &mut SocketPool, data: &[u8]) -> Result<()> {
    for i in 0..pool.len() {
        pool.write(i, data)?;
    }
    Ok(())
}

/// Worker: read the unit buffer root scattered, from its single root socket.
pub fn scatter_recv(pool: &mut SocketPool, out: &mut [u8]) -> Result<()> {
    pool.read(0, out)
}

/// Root: read each worker's own slice of `sliced` back into its region.
/// `slice_bytes(w)` is the byte length of worker `w`'s slice (worker
/// indices are socket indices `0..n_slices-1`, corresponding to slice
/// indices `1..n_slices`).
pub fn gather(pool: &mut SocketPool, sliced: &mut [u8], slice_offsets: &[(usize, usize)]) -> Result<()> {
    let mut ios: Vec<SocketIo> = Vec::with_capacity(pool.len());
    let mut remaining = sliced;
    let mut cursor = 0usize;
    for (i, &(offset, len)) in slice_offsets.iter().enumerate() {
        debug_assert_eq!(offset, cursor, "slice offsets must be contiguous and ascending");
        let (head, tail) = remaining.split_at_mut(len);
        ios.push(SocketIo { socket_index: i, data: head });
        remaining = tail;
        cursor += len;
    }
    pool.read_many(&mut ios)
}

/// Worker: send this node's own slice back to root.
pub fn gather_send(pool: &mut SocketPool, own_slice: &[u8]) -> Result<()> {
    pool.write(0, own_slice)
}

/// Root: for every pair of distinct workers `(src, dst)`, send `src`'s
/// slice of `sliced` to `dst` so every worker ends up owning the full
/// buffer. `slice_offsets[i]` is `(byte offset, byte len)` of socket `i`'s
/// (= slice index `i+1`'s) region within `sliced`.
pub fn broadcast_missing(pool: &mut SocketPool, sliced: &[u8], slice_offsets: &[(usize, usize)]) -> Result<()> {
    for dst in 0..pool.len() {
        for src in 0..pool.len() {
            if src == dst {
                continue;
            }
            let (offset, len) = slice_offsets[src];
            pool.write(dst, &sliced[offset..offset + len])?;
        }
    }
    Ok(())
}

/// Worker: receive every other worker's slice (n_slices - 1 reads) plus
/// root's own slice 0, filling `sliced` at the offsets the caller already
/// knows from the shared `MatmulSlice` descriptor.
pub fn broadcast_missing_recv(pool: &mut SocketPool, sliced: &mut [u8], missing_offsets: &[(usize, usize)]) -> Result<()> {
    for &(offset, len) in missing_offsets {
        pool.read(0, &mut sliced[offset..offset + len])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_offsets_must_be_contiguous() {
        // slice_offsets describing two adjacent regions should not panic.
        let offsets = vec![(0usize, 4usize), (4usize, 8usize)];
        let mut cursor = 0;
        for (offset, len) in &offsets {
            assert_eq!(*offset, cursor);
            cursor += len;
        }
    }
}
