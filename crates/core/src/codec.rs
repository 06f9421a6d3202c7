//! Ternary block codec: the packed-weight layout every kernel reads.
//!
//! A block holds [`BLOCK_LEN`] symbols at 2 bits each (4 per byte, symbol
//! `i` in bits `2*(i%4)..2*(i%4)+2`) followed by one `f32` scale:
//!
//! ```text
//! code  level
//!  00     0
//!  01    +1
//!  11    -1
//!  10   reserved (rejected)
//! ```
//!
//! `value[i] = level(code[i]) * scale`. Both kernel families unpack exactly
//! this table; a kernel that disagrees with it is wrong, not slow.

use candle_core::{Device, Tensor};
use rand::Rng;

use ternary_common::{MatrixShape, Result, TuneError, TERNARY_BLOCK_LEN};

/// Symbols per block.
pub const BLOCK_LEN: usize = TERNARY_BLOCK_LEN;
/// Packed code bytes per block.
pub const BLOCK_CODE_BYTES: usize = BLOCK_LEN / 4;
/// Serialised block size: codes + `f32` scale.
pub const BLOCK_BYTES: usize = BLOCK_CODE_BYTES + 4;

pub const CODE_ZERO: u8 = 0b00;
pub const CODE_POS: u8 = 0b01;
pub const CODE_NEG: u8 = 0b11;
pub const CODE_RESERVED: u8 = 0b10;

/// Level of a 2-bit code; `None` for the reserved code.
#[inline]
pub fn code_to_level(code: u8) -> Option<i8> {
    match code & 0b11 {
        CODE_ZERO => Some(0),
        CODE_POS => Some(1),
        CODE_NEG => Some(-1),
        _ => None,
    }
}

/// Code of a level; `None` outside {-1, 0, +1}.
#[inline]
pub fn level_to_code(level: i8) -> Option<u8> {
    match level {
        0 => Some(CODE_ZERO),
        1 => Some(CODE_POS),
        -1 => Some(CODE_NEG),
        _ => None,
    }
}

/// Level of a code known to be valid (reserved reads as 0).
#[inline]
pub(crate) fn level_of(code: u8) -> i8 {
    code_to_level(code).unwrap_or(0)
}

// ── TernaryBlock ────────────────────────────────────────────────────────────

/// 32 ternary symbols plus their shared scale.
///
/// Only constructible from valid levels, so a block never carries the
/// reserved code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TernaryBlock {
    codes: [u8; BLOCK_CODE_BYTES],
    scale: f32,
}

impl TernaryBlock {
    /// Pack levels in {-1, 0, +1}.
    pub fn from_levels(levels: &[i8], scale: f32) -> Result<Self> {
        if levels.len() != BLOCK_LEN {
            return Err(TuneError::Quantization(format!(
                "block needs {BLOCK_LEN} symbols, got {}",
                levels.len()
            )));
        }
        if !scale.is_finite() {
            return Err(TuneError::Quantization(format!("non-finite scale {scale}")));
        }
        let mut codes = [0u8; BLOCK_CODE_BYTES];
        for (i, &level) in levels.iter().enumerate() {
            let code = level_to_code(level).ok_or_else(|| {
                TuneError::Quantization(format!("symbol {i}: level {level} is not ternary"))
            })?;
            codes[i / 4] |= code << ((i % 4) * 2);
        }
        Ok(Self { codes, scale })
    }

    /// Encode values that are exactly `{-1, 0, +1} × scale`.
    ///
    /// Anything else is rejected; nothing is rounded.
    pub fn encode(values: &[f32], scale: f32) -> Result<Self> {
        let mut levels = [0i8; BLOCK_LEN];
        if values.len() != BLOCK_LEN {
            return Err(TuneError::Quantization(format!(
                "block needs {BLOCK_LEN} values, got {}",
                values.len()
            )));
        }
        for (i, &v) in values.iter().enumerate() {
            levels[i] = if v == 0.0 {
                0
            } else if v == scale {
                1
            } else if v == -scale {
                -1
            } else {
                return Err(TuneError::Quantization(format!(
                    "value {v} at {i} is not in {{-1, 0, +1}} x {scale}"
                )));
            };
        }
        Self::from_levels(&levels, scale)
    }

    /// Encode, taking the scale from the largest magnitude.
    pub fn encode_auto(values: &[f32]) -> Result<Self> {
        let scale = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        Self::encode(values, scale)
    }

    #[inline]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    #[inline]
    pub fn codes(&self) -> &[u8; BLOCK_CODE_BYTES] {
        &self.codes
    }

    /// 2-bit code of symbol `i`.
    #[inline]
    pub fn code(&self, i: usize) -> u8 {
        (self.codes[i / 4] >> ((i % 4) * 2)) & 0b11
    }

    /// 4-bit code of the symbol pair `(2p, 2p+1)`, `p < BLOCK_LEN / 2`.
    #[inline]
    pub fn pair_nibble(&self, p: usize) -> u8 {
        (self.codes[p / 2] >> ((p % 2) * 4)) & 0x0F
    }

    pub fn levels(&self) -> [i8; BLOCK_LEN] {
        let mut out = [0i8; BLOCK_LEN];
        for (i, l) in out.iter_mut().enumerate() {
            *l = level_of(self.code(i));
        }
        out
    }

    /// Dequantised values.
    pub fn decode(&self) -> [f32; BLOCK_LEN] {
        let mut out = [0f32; BLOCK_LEN];
        for (o, l) in out.iter_mut().zip(self.levels()) {
            *o = l as f32 * self.scale;
        }
        out
    }

    /// Code bytes followed by the scale as little-endian `f32`.
    pub fn to_bytes(&self) -> [u8; BLOCK_BYTES] {
        let mut out = [0u8; BLOCK_BYTES];
        out[..BLOCK_CODE_BYTES].copy_from_slice(&self.codes);
        out[BLOCK_CODE_BYTES..].copy_from_slice(&self.scale.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BLOCK_BYTES {
            return Err(TuneError::Quantization(format!(
                "block is {BLOCK_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        let mut codes = [0u8; BLOCK_CODE_BYTES];
        codes.copy_from_slice(&bytes[..BLOCK_CODE_BYTES]);
        let mut scale = [0u8; 4];
        scale.copy_from_slice(&bytes[BLOCK_CODE_BYTES..]);
        let block = Self {
            codes,
            scale: f32::from_le_bytes(scale),
        };
        if let Some(i) = (0..BLOCK_LEN).find(|&i| block.code(i) == CODE_RESERVED) {
            return Err(TuneError::Quantization(format!(
                "reserved code at symbol {i}"
            )));
        }
        if !block.scale.is_finite() {
            return Err(TuneError::Quantization(format!(
                "non-finite scale {}",
                block.scale
            )));
        }
        Ok(block)
    }
}

// ── PackedMatrix ────────────────────────────────────────────────────────────

/// Row-major packed weight matrix, `k / 32` blocks per row.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedMatrix {
    shape: MatrixShape,
    blocks: Vec<TernaryBlock>,
}

impl PackedMatrix {
    /// `levels` is `m*k` row-major, `scales` one per block (`m * k/32`).
    pub fn from_levels(shape: MatrixShape, levels: &[i8], scales: &[f32]) -> Result<Self> {
        let per_row = shape.blocks_per_row();
        if levels.len() != shape.m() * shape.k() || scales.len() != shape.m() * per_row {
            return Err(TuneError::Quantization(format!(
                "{shape}: expected {} levels and {} scales, got {} and {}",
                shape.m() * shape.k(),
                shape.m() * per_row,
                levels.len(),
                scales.len()
            )));
        }
        let blocks = levels
            .chunks_exact(BLOCK_LEN)
            .zip(scales)
            .map(|(l, &s)| TernaryBlock::from_levels(l, s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { shape, blocks })
    }

    pub fn from_blocks(shape: MatrixShape, blocks: Vec<TernaryBlock>) -> Result<Self> {
        if blocks.len() != shape.m() * shape.blocks_per_row() {
            return Err(TuneError::Quantization(format!(
                "{shape}: expected {} blocks, got {}",
                shape.m() * shape.blocks_per_row(),
                blocks.len()
            )));
        }
        Ok(Self { shape, blocks })
    }

    /// Uniformly random levels, scales in `[0.01, 2.0)`.
    pub fn random<R: Rng>(shape: MatrixShape, rng: &mut R) -> Self {
        let blocks = (0..shape.m() * shape.blocks_per_row())
            .map(|_| {
                let mut codes = [0u8; BLOCK_CODE_BYTES];
                for c in codes.iter_mut() {
                    for s in 0..4 {
                        let code = match rng.gen_range(0..3) {
                            0 => CODE_ZERO,
                            1 => CODE_POS,
                            _ => CODE_NEG,
                        };
                        *c |= code << (s * 2);
                    }
                }
                TernaryBlock {
                    codes,
                    scale: rng.gen_range(0.01f32..2.0),
                }
            })
            .collect();
        Self { shape, blocks }
    }

    #[inline]
    pub fn shape(&self) -> MatrixShape {
        self.shape
    }

    pub fn blocks(&self) -> &[TernaryBlock] {
        &self.blocks
    }

    /// Blocks of one row.
    #[inline]
    pub fn row_blocks(&self, row: usize) -> &[TernaryBlock] {
        let per_row = self.shape.blocks_per_row();
        &self.blocks[row * per_row..(row + 1) * per_row]
    }

    /// Dequantised row-major values.
    pub fn dequantize(&self) -> Vec<f32> {
        self.blocks.iter().flat_map(|b| b.decode()).collect()
    }

    /// Dequantised `(m, k)` tensor for the tensor runtime.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(self.dequantize(), (self.shape.m(), self.shape.k()), device)
            .map_err(|e| TuneError::Tensor(e.to_string()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.blocks.iter().flat_map(|b| b.to_bytes()).collect()
    }

    pub fn from_bytes(shape: MatrixShape, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % BLOCK_BYTES != 0 {
            return Err(TuneError::Quantization(format!(
                "{} bytes is not a whole number of blocks",
                bytes.len()
            )));
        }
        let blocks = bytes
            .chunks_exact(BLOCK_BYTES)
            .map(TernaryBlock::from_bytes)
            .collect::<Result<Vec<_>>>()?;
        Self::from_blocks(shape, blocks)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pattern() -> [i8; BLOCK_LEN] {
        let mut l = [0i8; BLOCK_LEN];
        for (i, v) in l.iter_mut().enumerate() {
            *v = [-1, 0, 1][i % 3];
        }
        l
    }

    #[test]
    fn code_table() {
        assert_eq!(code_to_level(0b00), Some(0));
        assert_eq!(code_to_level(0b01), Some(1));
        assert_eq!(code_to_level(0b11), Some(-1));
        assert_eq!(code_to_level(0b10), None);
        assert_eq!(level_to_code(2), None);
    }

    #[test]
    fn bit_layout_matches_table() {
        let mut levels = [0i8; BLOCK_LEN];
        levels[0] = 1;
        levels[1] = -1;
        levels[5] = 1;
        let b = TernaryBlock::from_levels(&levels, 1.0).unwrap();
        // symbol 0 → bits 0-1 = 01, symbol 1 → bits 2-3 = 11
        assert_eq!(b.codes()[0], 0b0000_1101);
        // symbol 5 → byte 1, bits 2-3
        assert_eq!(b.codes()[1], 0b0000_0100);
        assert_eq!(b.pair_nibble(0), 0b1101);
    }

    #[test]
    fn encode_rejects_non_ternary() {
        let mut values = [0f32; BLOCK_LEN];
        values[3] = 0.5;
        values[4] = 0.25;
        let err = TernaryBlock::encode(&values, 0.5).unwrap_err();
        assert!(matches!(err, TuneError::Quantization(_)));
        values[4] = f32::NAN;
        assert!(TernaryBlock::encode(&values, 0.5).is_err());
        assert!(TernaryBlock::encode(&values[..8], 0.5).is_err());
        assert!(TernaryBlock::from_levels(&[2i8; BLOCK_LEN], 1.0).is_err());
    }

    #[test]
    fn encode_auto_picks_scale() {
        let values: Vec<f32> = pattern().iter().map(|&l| l as f32 * 0.75).collect();
        let b = TernaryBlock::encode_auto(&values).unwrap();
        assert_eq!(b.scale(), 0.75);
        assert_eq!(b.levels(), pattern());
    }

    #[test]
    fn reserved_code_rejected_on_read() {
        let good = TernaryBlock::from_levels(&pattern(), 1.5).unwrap();
        let mut bytes = good.to_bytes();
        assert_eq!(TernaryBlock::from_bytes(&bytes).unwrap(), good);
        bytes[2] = (bytes[2] & !0b11) | CODE_RESERVED;
        assert!(TernaryBlock::from_bytes(&bytes).is_err());
        assert!(TernaryBlock::from_bytes(&bytes[..5]).is_err());
    }

    #[test]
    fn matrix_rows_and_tensor() {
        let shape = MatrixShape::new(4, 64).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let w = PackedMatrix::random(shape, &mut rng);
        assert_eq!(w.blocks().len(), 8);
        assert_eq!(w.row_blocks(3).len(), 2);
        let t = w.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[4, 64]);
        let back = PackedMatrix::from_bytes(shape, &w.to_bytes()).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn matrix_size_checks() {
        let shape = MatrixShape::new(2, 32).unwrap();
        assert!(PackedMatrix::from_levels(shape, &[0; 64], &[1.0]).is_err());
        assert!(PackedMatrix::from_levels(shape, &[0; 64], &[1.0, 1.0]).is_ok());
    }

    proptest! {
        #[test]
        fn round_trip_law(
            levels in proptest::collection::vec(-1i8..=1, BLOCK_LEN),
            scale in prop_oneof![1e-6f32..1e-3, 1e-3f32..1.0, 1.0f32..1e4],
        ) {
            let block = TernaryBlock::from_levels(&levels, scale).unwrap();
            let values = block.decode();
            for (v, &l) in values.iter().zip(&levels) {
                prop_assert_eq!(*v, l as f32 * scale);
            }
            let again = TernaryBlock::encode(&values, scale).unwrap();
            prop_assert_eq!(again.levels().to_vec(), levels);
            prop_assert_eq!(again.decode(), values);
        }
    }
}
