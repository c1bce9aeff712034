//! Model specification — the immutable per-run descriptor parsed from the
//! weights file header and broadcast from root to every worker.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use shardllm_core::error::{Result, ShardLlmError};
use std::io::{Read, Write};

const MAGIC_LEGACY_V0: u32 = 0xABCD00;
const MAGIC_LEGACY_V1: u32 = 0xABCD01;
const MAGIC_TLV: u32 = 0x0A00ABCD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchType {
    Llama2,
    Grok1,
    Mixtral,
}

impl ArchType {
    fn to_code(self) -> u32 {
        match self {
            ArchType::Llama2 => 0,
            ArchType::Grok1 => 1,
            ArchType::Mixtral => 2,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(ArchType::Llama2),
            1 => Ok(ArchType::Grok1),
            2 => Ok(ArchType::Mixtral),
            other => Err(ShardLlmError::CorruptWeightsFile(format!("unknown arch type code {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenAct {
    Gelu,
    Silu,
}

impl HiddenAct {
    fn to_code(self) -> u32 {
        match self {
            HiddenAct::Gelu => 0,
            HiddenAct::Silu => 1,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(HiddenAct::Gelu),
            1 => Ok(HiddenAct::Silu),
            other => Err(ShardLlmError::CorruptWeightsFile(format!("unknown hidden_act code {other}"))),
        }
    }
}

/// Weight/buffer element encoding. Mirrors `shardllm_core::config::FloatKind`
/// but lives in the brain crate since it participates in block-size math
/// that config has no business knowing about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatType {
    F32,
    F16,
    Q4_0,
    Q8_0,
}

impl FloatType {
    /// Bytes occupied by one block of this type, or the per-element byte
    /// width for unblocked types (F32/F16 report as if block size 1).
    pub fn block_bytes(self) -> usize {
        match self {
            FloatType::F32 => 4,
            FloatType::F16 => 2,
            FloatType::Q4_0 => 18,
            FloatType::Q8_0 => 34,
        }
    }

    pub fn block_size(self) -> usize {
        match self {
            FloatType::F32 | FloatType::F16 => 1,
            FloatType::Q4_0 | FloatType::Q8_0 => 32,
        }
    }

    /// Total bytes needed to store `n_elements` of this type (the
    /// "batchBytes" granularity from the slicing contract).
    pub fn row_bytes(self, n_elements: usize) -> usize {
        let bs = self.block_size();
        debug_assert_eq!(
            n_elements % bs,
            0,
            "n_elements must be a multiple of the block size"
        );
        (n_elements / bs) * self.block_bytes()
    }

    pub fn from_header_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(FloatType::F32),
            1 => Ok(FloatType::F16),
            2 => Ok(FloatType::Q4_0),
            3 => Ok(FloatType::Q8_0),
            other => Err(ShardLlmError::CorruptWeightsFile(format!(
                "unknown float type code {other}"
            ))),
        }
    }

    pub fn to_header_code(self) -> u32 {
        match self {
            FloatType::F32 => 0,
            FloatType::F16 => 1,
            FloatType::Q4_0 => 2,
            FloatType::Q8_0 => 3,
        }
    }

    /// Map the CLI/config-facing dtype enum onto this crate's own, which
    /// additionally carries block-size math the config layer has no
    /// business knowing about.
    pub fn from_config(kind: shardllm_core::config::FloatKind) -> Self {
        match kind {
            shardllm_core::config::FloatKind::F32 => FloatType::F32,
            shardllm_core::config::FloatKind::F16 => FloatType::F16,
            shardllm_core::config::FloatKind::Q4_0 => FloatType::Q4_0,
            shardllm_core::config::FloatKind::Q8_0 => FloatType::Q8_0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFormat {
    LegacyV0,
    LegacyV1,
    Tlv,
}

/// Immutable per-run model descriptor.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub arch_type: ArchType,
    pub dim: u32,
    pub hidden_dim: u32,
    pub n_layers: u32,
    pub n_heads: u32,
    pub n_kv_heads: u32,
    pub head_size: u32,
    pub kv_dim: u32,
    pub seq_len: u32,
    pub vocab_size: u32,
    pub n_experts: u32,
    pub n_active_experts: u32,
    pub hidden_act: HiddenAct,
    pub rope_theta: f32,
    pub weights_float_type: FloatType,
    pub buffer_float_type: FloatType,
    pub n_slices: u32,
    pub header_size: u64,
    pub file_size: u64,
}

impl ModelSpec {
    pub fn is_moe(&self) -> bool {
        self.n_experts > 0
    }

    /// Validate the invariants spec.md §3 requires of a ModelSpec.
    pub fn validate(&self) -> Result<()> {
        if self.dim % self.n_heads != 0 {
            return Err(ShardLlmError::InvalidShape(format!(
                "dim {} not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.dim % self.n_kv_heads != 0 {
            return Err(ShardLlmError::InvalidShape(format!(
                "dim {} not divisible by n_kv_heads {}",
                self.dim, self.n_kv_heads
            )));
        }
        if self.n_slices == 0 {
            return Err(ShardLlmError::InvalidShape("n_slices must be >= 1".into()));
        }
        Ok(())
    }

    /// Serialize this spec for the root→worker bootstrap handshake. This is
    /// an internal wire format, distinct from the on-disk legacy/TLV header:
    /// every field is sent raw and in full since the handshake, unlike the
    /// file header, never needs to stay compatible with older model files.
    pub fn write_wire<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.arch_type.to_code())?;
        w.write_u32::<LittleEndian>(self.dim)?;
        w.write_u32::<LittleEndian>(self.hidden_dim)?;
        w.write_u32::<LittleEndian>(self.n_layers)?;
        w.write_u32::<LittleEndian>(self.n_heads)?;
        w.write_u32::<LittleEndian>(self.n_kv_heads)?;
        w.write_u32::<LittleEndian>(self.head_size)?;
        w.write_u32::<LittleEndian>(self.kv_dim)?;
        w.write_u32::<LittleEndian>(self.seq_len)?;
        w.write_u32::<LittleEndian>(self.vocab_size)?;
        w.write_u32::<LittleEndian>(self.n_experts)?;
        w.write_u32::<LittleEndian>(self.n_active_experts)?;
        w.write_u32::<LittleEndian>(self.hidden_act.to_code())?;
        w.write_f32::<LittleEndian>(self.rope_theta)?;
        w.write_u32::<LittleEndian>(self.weights_float_type.to_header_code())?;
        w.write_u32::<LittleEndian>(self.buffer_float_type.to_header_code())?;
        w.write_u32::<LittleEndian>(self.n_slices)?;
        w.write_u64::<LittleEndian>(self.header_size)?;
        w.write_u64::<LittleEndian>(self.file_size)?;
        Ok(())
    }

    pub fn read_wire<R: Read>(r: &mut R) -> Result<Self> {
        let arch_type = ArchType::from_code(r.read_u32::<LittleEndian>()?)?;
        let dim = r.read_u32::<LittleEndian>()?;
        let hidden_dim = r.read_u32::<LittleEndian>()?;
        let n_layers = r.read_u32::<LittleEndian>()?;
        let n_heads = r.read_u32::<LittleEndian>()?;
        let n_kv_heads = r.read_u32::<LittleEndian>()?;
        let head_size = r.read_u32::<LittleEndian>()?;
        let kv_dim = r.read_u32::<LittleEndian>()?;
        let seq_len = r.read_u32::<LittleEndian>()?;
        let vocab_size = r.read_u32::<LittleEndian>()?;
        let n_experts = r.read_u32::<LittleEndian>()?;
        let n_active_experts = r.read_u32::<LittleEndian>()?;
        let hidden_act = HiddenAct::from_code(r.read_u32::<LittleEndian>()?)?;
        let rope_theta = r.read_f32::<LittleEndian>()?;
        let weights_float_type = FloatType::from_header_code(r.read_u32::<LittleEndian>()?)?;
        let buffer_float_type = FloatType::from_header_code(r.read_u32::<LittleEndian>()?)?;
        let n_slices = r.read_u32::<LittleEndian>()?;
        let header_size = r.read_u64::<LittleEndian>()?;
        let file_size = r.read_u64::<LittleEndian>()?;

        let spec = ModelSpec {
            arch_type,
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            head_size,
            kv_dim,
            seq_len,
            vocab_size,
            n_experts,
            n_active_experts,
            hidden_act,
            rope_theta,
            weights_float_type,
            buffer_float_type,
            n_slices,
            header_size,
            file_size,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Parse a model spec from the header of a weights file, reading only
    /// the header bytes (the reader should be positioned at offset 0).
    pub fn parse_header<R: Read>(
        reader: &mut R,
        weights_float_type: FloatType,
        buffer_float_type: FloatType,
        n_slices: u32,
        file_size: u64,
    ) -> Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        match magic {
            MAGIC_LEGACY_V0 | MAGIC_LEGACY_V1 => {
                Self::parse_legacy_header(reader, weights_float_type, buffer_float_type, n_slices, file_size)
            }
            MAGIC_TLV => {
                Self::parse_tlv_header(reader, weights_float_type, buffer_float_type, n_slices, file_size)
            }
            other => Err(ShardLlmError::CorruptWeightsFile(format!(
                "unrecognized magic 0x{other:08X}"
            ))),
        }
    }

    fn parse_legacy_header<R: Read>(
        reader: &mut R,
        weights_float_type: FloatType,
        buffer_float_type: FloatType,
        n_slices: u32,
        file_size: u64,
    ) -> Result<Self> {
        let dim = reader.read_i32::<LittleEndian>()? as u32;
        let hidden_dim = reader.read_i32::<LittleEndian>()? as u32;
        let n_layers = reader.read_i32::<LittleEndian>()? as u32;
        let n_heads = reader.read_i32::<LittleEndian>()? as u32;
        let n_kv_heads = reader.read_i32::<LittleEndian>()? as u32;
        let n_experts = reader.read_i32::<LittleEndian>()? as u32;
        let n_active_experts = reader.read_i32::<LittleEndian>()? as u32;
        let vocab_size = reader.read_i32::<LittleEndian>()? as u32;
        let seq_len = reader.read_i32::<LittleEndian>()? as u32;

        let header_size = 4 + 9 * 4;
        let head_size = dim / n_heads.max(1);
        let kv_dim = head_size * n_kv_heads;

        let spec = ModelSpec {
            arch_type: ArchType::Llama2,
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            head_size,
            kv_dim,
            seq_len,
            vocab_size,
            n_experts,
            n_active_experts,
            hidden_act: HiddenAct::Silu,
            rope_theta: 10000.0,
            weights_float_type,
            buffer_float_type,
            n_slices,
            header_size: header_size as u64,
            file_size,
        };
        spec.validate()?;
        Ok(spec)
    }

    fn parse_tlv_header<R: Read>(
        reader: &mut R,
        weights_float_type: FloatType,
        buffer_float_type: FloatType,
        n_slices: u32,
        file_size: u64,
    ) -> Result<Self> {
        let header_size = reader.read_u32::<LittleEndian>()?;
        let mut remaining = header_size as i64;

        let mut arch_type = ArchType::Llama2;
        let mut dim = 0u32;
        let mut hidden_dim = 0u32;
        let mut n_layers = 0u32;
        let mut n_heads = 0u32;
        let mut n_kv_heads = 0u32;
        let mut n_experts = 0u32;
        let mut n_active_experts = 0u32;
        let mut vocab_size = 0u32;
        let mut seq_len = 0u32;
        let mut hidden_act = HiddenAct::Silu;
        let mut rope_theta = 10000.0f32;
        let mut version = 1u32;

        while remaining > 0 {
            let key = reader.read_u32::<LittleEndian>()?;
            let value = reader.read_i32::<LittleEndian>()?;
            remaining -= 8;
            match key {
                0 => version = value as u32,
                1 => {
                    arch_type = match value {
                        0 => ArchType::Llama2,
                        1 => ArchType::Grok1,
                        2 => ArchType::Mixtral,
                        other => {
                            return Err(ShardLlmError::CorruptWeightsFile(format!(
                                "unknown arch type {other}"
                            )))
                        }
                    }
                }
                2 => dim = value as u32,
                3 => hidden_dim = value as u32,
                4 => n_layers = value as u32,
                5 => n_heads = value as u32,
                6 => n_kv_heads = value as u32,
                7 => n_experts = value as u32,
                8 => n_active_experts = value as u32,
                9 => vocab_size = value as u32,
                10 => seq_len = value as u32,
                11 => {
                    hidden_act = match value {
                        0 => HiddenAct::Gelu,
                        1 => HiddenAct::Silu,
                        other => {
                            return Err(ShardLlmError::CorruptWeightsFile(format!(
                                "unknown hidden_act {other}"
                            )))
                        }
                    }
                }
                12 => rope_theta = f32::from_bits(value as u32),
                other => {
                    return Err(ShardLlmError::CorruptWeightsFile(format!(
                        "unsupported header key {other}"
                    )))
                }
            }
        }
        let _ = version;

        let head_size = dim / n_heads.max(1);
        let kv_dim = head_size * n_kv_heads;

        let spec = ModelSpec {
            arch_type,
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            head_size,
            kv_dim,
            seq_len,
            vocab_size,
            n_experts,
            n_active_experts,
            hidden_act,
            rope_theta,
            weights_float_type,
            buffer_float_type,
            n_slices,
            header_size: (4 + 4 + header_size) as u64,
            file_size,
        };
        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    #[test]
    fn legacy_header_round_trip() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(MAGIC_LEGACY_V0).unwrap();
        for v in [128i32, 256, 2, 4, 4, 0, 0, 64, 32] {
            buf.write_i32::<LittleEndian>(v).unwrap();
        }
        let mut cursor = Cursor::new(buf);
        let spec = ModelSpec::parse_header(&mut cursor, FloatType::F32, FloatType::F32, 1, 1000).unwrap();
        assert_eq!(spec.dim, 128);
        assert_eq!(spec.n_heads, 4);
        assert_eq!(spec.head_size, 32);
        assert_eq!(spec.kv_dim, 128);
    }

    #[test]
    fn tlv_header_round_trip() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(MAGIC_TLV).unwrap();
        let entries: &[(u32, i32)] = &[
            (1, 0), // ARCH_TYPE = LLAMA2
            (2, 128),
            (3, 256),
            (4, 2),
            (5, 4),
            (6, 4),
            (9, 64),
            (10, 32),
        ];
        buf.write_u32::<LittleEndian>((entries.len() * 8) as u32).unwrap();
        for (k, v) in entries {
            buf.write_u32::<LittleEndian>(*k).unwrap();
            buf.write_i32::<LittleEndian>(*v).unwrap();
        }
        let mut cursor = Cursor::new(buf);
        let spec = ModelSpec::parse_header(&mut cursor, FloatType::Q4_0, FloatType::Q8_0, 2, 5000).unwrap();
        assert_eq!(spec.dim, 128);
        assert_eq!(spec.vocab_size, 64);
        assert_eq!(spec.arch_type, ArchType::Llama2);
    }

    #[test]
    fn unknown_header_key_fails() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(MAGIC_TLV).unwrap();
        buf.write_u32::<LittleEndian>(8).unwrap();
        buf.write_u32::<LittleEndian>(999).unwrap();
        buf.write_i32::<LittleEndian>(0).unwrap();
        let mut cursor = Cursor::new(buf);
        let err = ModelSpec::parse_header(&mut cursor, FloatType::F32, FloatType::F32, 1, 100);
        assert!(err.is_err());
    }

    #[test]
    fn wire_round_trip_preserves_every_field() {
        let spec = ModelSpec {
            arch_type: ArchType::Grok1,
            dim: 256,
            hidden_dim: 512,
            n_layers: 4,
            n_heads: 8,
            n_kv_heads: 4,
            head_size: 32,
            kv_dim: 128,
            seq_len: 2048,
            vocab_size: 32000,
            n_experts: 8,
            n_active_experts: 2,
            hidden_act: HiddenAct::Gelu,
            rope_theta: 1e6,
            weights_float_type: FloatType::Q4_0,
            buffer_float_type: FloatType::Q8_0,
            n_slices: 3,
            header_size: 64,
            file_size: 123456,
        };
        let mut buf = Vec::new();
        spec.write_wire(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = ModelSpec::read_wire(&mut cursor).unwrap();
        assert_eq!(decoded.arch_type, spec.arch_type);
        assert_eq!(decoded.dim, spec.dim);
        assert_eq!(decoded.n_experts, spec.n_experts);
        assert_eq!(decoded.weights_float_type, spec.weights_float_type);
        assert_eq!(decoded.buffer_float_type, spec.buffer_float_type);
        assert_eq!(decoded.rope_theta, spec.rope_theta);
        assert_eq!(decoded.file_size, spec.file_size);
    }
}
