//! Key/value cache — stores every past token's key and value vectors per
//! layer so the attention step never recomputes them.
//!
//! Owned entirely by the root node's `TransformerBlock`: a worker slice
//! never materializes attention (the full query/key/value projections are
//! gathered to root before the attention task runs).

pub struct KvCache {
    key_cache: Vec<f32>,
    value_cache: Vec<f32>,
    n_layers: usize,
    seq_len: usize,
    kv_dim: usize,
}

impl KvCache {
    pub fn new(n_layers: usize, seq_len: usize, kv_dim: usize) -> Self {
        let total = n_layers * seq_len * kv_dim;
        KvCache {
            key_cache: vec![0.0; total],
            value_cache: vec![0.0; total],
            n_layers,
            seq_len,
            kv_dim,
        }
    }

    pub fn key_at_mut(&mut self, layer: usize, pos: usize) -> &mut [f32] {
        let offset = (layer * self.seq_len + pos) * self.kv_dim;
        &mut self.key_cache[offset..offset + self.kv_dim]
    }

    pub fn value_at_mut(&mut self, layer: usize, pos: usize) -> &mut [f32] {
        let offset = (layer * self.seq_len + pos) * self.kv_dim;
        &mut self.value_cache[offset..offset + self.kv_dim]
    }

    /// Key vector for `(layer, t)` at KV-head offset `kv_head_offset`
    /// (already multiplied by `head_size`).
    pub fn key_head(&self, layer: usize, t: usize, kv_head_offset: usize, head_size: usize) -> &[f32] {
        let offset = (layer * self.seq_len + t) * self.kv_dim + kv_head_offset;
        &self.key_cache[offset..offset + head_size]
    }

    pub fn value_head(&self, layer: usize, t: usize, kv_head_offset: usize, head_size: usize) -> &[f32] {
        let offset = (layer * self.seq_len + t) * self.kv_dim + kv_head_offset;
        &self.value_cache[offset..offset + head_size]
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn reset(&mut self) {
        self.key_cache.fill(0.0);
        self.value_cache.fill(0.0);
    }

    pub fn memory_usage(&self) -> usize {
        (self.key_cache.len() + self.value_cache.len()) * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_reads_round_trip_per_layer_and_position() {
        let mut cache = KvCache::new(2, 8, 4);
        cache.key_at_mut(1, 3).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(cache.key_head(1, 3, 0, 4), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(cache.key_head(0, 3, 0, 4), &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn reset_clears_every_layer() {
        let mut cache = KvCache::new(1, 4, 2);
        cache.value_at_mut(0, 0).copy_from_slice(&[9.0, 9.0]);
        cache.reset();
        assert_eq!(cache.value_head(0, 0, 0, 2), &[0.0, 0.0]);
    }
}
