//! BPE tokenizer — byte-fallback encode and piece decode over a flat,
//! score-ranked vocabulary loaded from a tokenizer file. Sits outside the
//! forward-pass pipeline: the CLI binaries turn a prompt into token ids
//! before bootstrap and turn sampled ids back into text after each step.

use byteorder::{LittleEndian, ReadBytesExt};
use shardllm_core::error::{Result, ShardLlmError};
use std::io::Read;

const TOKENIZER_MAGIC: u32 = 0x567123;

/// Fixed-int header at the front of a tokenizer file.
#[derive(Debug, Clone, Copy)]
pub struct TokenizerHeader {
    pub vocab_size: i32,
    pub max_token_length: i32,
    pub bos_id: i32,
    pub eos_id: i32,
}

impl TokenizerHeader {
    fn read<R: Read>(r: &mut R, expected_vocab_size: i32) -> Result<Self> {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != TOKENIZER_MAGIC {
            return Err(ShardLlmError::CorruptWeightsFile(format!("tokenizer magic mismatch: got {magic:#x}")));
        }
        let vocab_size = r.read_i32::<LittleEndian>()?;
        if vocab_size != expected_vocab_size {
            return Err(ShardLlmError::CorruptWeightsFile(format!(
                "tokenizer vocab size {vocab_size} does not match model vocab size {expected_vocab_size}"
            )));
        }
        let max_token_length = r.read_i32::<LittleEndian>()?;
        let bos_id = r.read_i32::<LittleEndian>()?;
        let eos_id = r.read_i32::<LittleEndian>()?;
        Ok(TokenizerHeader { vocab_size, max_token_length, bos_id, eos_id })
    }
}

/// One `(score, bytes)` vocabulary entry, string-sortable for the
/// binary-search lookup `encode` leans on.
#[derive(Debug, Clone)]
struct VocabEntry {
    score: f32,
    piece: Vec<u8>,
}

/// Flat score-ranked vocabulary plus a sorted-by-bytes index for exact
/// piece lookup during encode.
pub struct BpeTokenizer {
    vocab: Vec<VocabEntry>,
    sorted: Vec<usize>,
    pub bos_id: i32,
    pub eos_id: i32,
    pub max_token_length: i32,
}

impl BpeTokenizer {
    /// Parse a tokenizer file: header then `vocab_size` `(score: f32, len:
    /// i32, bytes: len)` records, in id order.
    pub fn load<R: Read>(r: &mut R, vocab_size: i32) -> Result<Self> {
        let header = TokenizerHeader::read(r, vocab_size)?;

        let mut vocab = Vec::with_capacity(header.vocab_size as usize);
        for _ in 0..header.vocab_size {
            let score = r.read_f32::<LittleEndian>()?;
            let len = r.read_i32::<LittleEndian>()?;
            if len < 0 {
                return Err(ShardLlmError::CorruptWeightsFile(format!("negative token length {len}")));
            }
            let mut piece = vec![0u8; len as usize];
            r.read_exact(&mut piece)?;
            vocab.push(VocabEntry { score, piece });
        }

        let mut sorted: Vec<usize> = (0..vocab.len()).collect();
        sorted.sort_by(|&a, &b| vocab[a].piece.cmp(&vocab[b].piece));

        Ok(BpeTokenizer {
            vocab,
            sorted,
            bos_id: header.bos_id,
            eos_id: header.eos_id,
            max_token_length: header.max_token_length,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn lookup(&self, piece: &[u8]) -> Option<i32> {
        let idx = self.sorted.binary_search_by(|&i| self.vocab[i].piece.as_slice().cmp(piece)).ok()?;
        Some(self.sorted[idx] as i32)
    }

    /// Render `token` to its displayable piece. `prev_token == bos_id`
    /// strips one leading space (sentencepiece convention); a `<0xXX>`
    /// piece decodes to its single raw byte.
    pub fn decode(&self, prev_token: i32, token: i32) -> Result<Vec<u8>> {
        let entry = self
            .vocab
            .get(token as usize)
            .ok_or_else(|| ShardLlmError::InvalidShape(format!("token id {token} out of vocab range")))?;
        let mut piece: &[u8] = &entry.piece;
        if prev_token == self.bos_id && piece.first() == Some(&b' ') {
            piece = &piece[1..];
        }
        if let Some(byte) = parse_raw_byte_piece(piece) {
            return Ok(vec![byte]);
        }
        Ok(piece.to_vec())
    }

    /// Encode `text` to token ids: optional BOS, a dummy-prefix space
    /// token when the text is non-empty, UTF-8 codepoints looked up whole
    /// or byte-fallback-exploded, then greedy best-score adjacent-pair
    /// merging until no mergeable pair remains.
    pub fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Vec<i32> {
        let mut tokens = Vec::with_capacity(text.len() + 3);

        if add_bos {
            tokens.push(self.bos_id);
        }

        if !text.is_empty() {
            if let Some(space_id) = self.lookup(b" ") {
                tokens.push(space_id);
            }
        }

        for ch in text.chars() {
            let mut buf = [0u8; 4];
            let bytes = ch.encode_utf8(&mut buf).as_bytes();
            match self.lookup(bytes) {
                Some(id) => tokens.push(id),
                None => {
                    for &b in bytes {
                        tokens.push(b as i32 + 3);
                    }
                }
            }
        }

        loop {
            let mut best_score = f32::NEG_INFINITY;
            let mut best_id = None;
            let mut best_pos = None;

            for i in 0..tokens.len().saturating_sub(1) {
                let mut merged = self.vocab[tokens[i] as usize].piece.clone();
                merged.extend_from_slice(&self.vocab[tokens[i + 1] as usize].piece);
                if let Some(id) = self.lookup(&merged) {
                    let score = self.vocab[id as usize].score;
                    if score > best_score {
                        best_score = score;
                        best_id = Some(id);
                        best_pos = Some(i);
                    }
                }
            }

            match (best_id, best_pos) {
                (Some(id), Some(pos)) => {
                    tokens[pos] = id;
                    tokens.remove(pos + 1);
                }
                _ => break,
            }
        }

        if add_eos {
            tokens.push(self.eos_id);
        }

        tokens
    }
}

/// `<0xXX>` raw-byte piece, the fallback encoding for bytes with no
/// standalone vocab entry.
fn parse_raw_byte_piece(piece: &[u8]) -> Option<u8> {
    let s = std::str::from_utf8(piece).ok()?;
    let hex = s.strip_prefix("<0x")?.strip_suffix('>')?;
    u8::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_header(buf: &mut Vec<u8>, vocab_size: i32, max_token_length: i32, bos_id: i32, eos_id: i32) {
        buf.extend_from_slice(&TOKENIZER_MAGIC.to_le_bytes());
        buf.extend_from_slice(&vocab_size.to_le_bytes());
        buf.extend_from_slice(&max_token_length.to_le_bytes());
        buf.extend_from_slice(&bos_id.to_le_bytes());
        buf.extend_from_slice(&eos_id.to_le_bytes());
    }

    fn write_entry(buf: &mut Vec<u8>, score: f32, piece: &[u8]) {
        buf.extend_from_slice(&score.to_le_bytes());
        buf.extend_from_slice(&(piece.len() as i32).to_le_bytes());
        buf.extend_from_slice(piece);
    }

    fn tiny_tokenizer() -> BpeTokenizer {
        let mut buf = Vec::new();
        // <unk>, <s>, </s>, then a handful of real pieces plus the 256
        // raw-byte fallback tokens used by encode's byte path.
        let mut pieces: Vec<(f32, Vec<u8>)> = vec![
            (0.0, b"<unk>".to_vec()),
            (0.0, b"<s>".to_vec()),
            (0.0, b"</s>".to_vec()),
        ];
        for b in 0u16..256 {
            pieces.push((-1.0, vec![b as u8]));
        }
        pieces.push((0.1, b" ".to_vec()));
        pieces.push((0.2, b"h".to_vec()));
        pieces.push((0.3, b"i".to_vec()));
        pieces.push((5.0, b"hi".to_vec()));

        write_header(&mut buf, pieces.len() as i32, 8, 1, 2);
        for (score, piece) in &pieces {
            write_entry(&mut buf, *score, piece);
        }

        BpeTokenizer::load(&mut Cursor::new(buf), pieces.len() as i32).unwrap()
    }

    #[test]
    fn encode_merges_adjacent_pieces_by_score() {
        let tok = tiny_tokenizer();
        let ids = tok.encode("hi", false, false);
        // " " (dummy prefix) then the merged "hi" token.
        assert_eq!(ids.len(), 2);
        let merged_id = tok.lookup(b"hi").unwrap();
        assert_eq!(*ids.last().unwrap(), merged_id);
    }

    #[test]
    fn encode_wraps_bos_and_eos() {
        let tok = tiny_tokenizer();
        let ids = tok.encode("hi", true, true);
        assert_eq!(ids.first(), Some(&tok.bos_id));
        assert_eq!(ids.last(), Some(&tok.eos_id));
    }

    #[test]
    fn decode_strips_leading_space_after_bos() {
        let tok = tiny_tokenizer();
        let space_id = tok.lookup(b" ").unwrap();
        let piece = tok.decode(tok.bos_id, space_id).unwrap();
        assert!(piece.is_empty());
    }

    #[test]
    fn decode_resolves_raw_byte_token() {
        let tok = tiny_tokenizer();
        let byte_id = tok.lookup(&[0x41]).unwrap();
        // The literal single-byte 'A' piece decodes to itself directly,
        // no <0xXX> escaping needed since it round-tripped as a real byte.
        let piece = tok.decode(-1, byte_id).unwrap();
        assert_eq!(piece, vec![0x41]);
    }

    #[test]
    fn raw_byte_piece_parses_hex_escape() {
        assert_eq!(parse_raw_byte_piece(b"<0x41>"), Some(0x41));
        assert_eq!(parse_raw_byte_piece(b"hi"), None);
    }
}
