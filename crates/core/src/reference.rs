//! Naive reference GEMV over packed ternary weights.
//!
//! Every tiled kernel must reproduce [`ternary_gemv`] bit for bit: per row,
//! an integer dot product per codec block, flushed as `isum * block_scale`
//! into a float accumulator in ascending block order, then one multiply by
//! the activation scale.

use candle_core::{Device, Tensor};

use ternary_common::{Result, TuneError};

use crate::codec::{level_of, PackedMatrix, TernaryBlock, BLOCK_LEN};
use crate::quantize::QuantizedActivations;

/// Integer dot product of one block with its 32 activations.
#[inline]
pub fn block_dot(block: &TernaryBlock, act: &[i8]) -> i32 {
    let mut isum = 0i32;
    for (i, &a) in act.iter().take(BLOCK_LEN).enumerate() {
        isum += level_of(block.code(i)) as i32 * a as i32;
    }
    isum
}

pub(crate) fn check_len(weights: &PackedMatrix, act: &QuantizedActivations) -> Result<()> {
    if act.len() != weights.shape().k() {
        return Err(TuneError::InvalidShape {
            m: weights.shape().m(),
            k: weights.shape().k(),
            reason: format!("activation vector has {} elements", act.len()),
        });
    }
    Ok(())
}

/// `y = W · a`, the semantics both kernel families implement.
pub fn ternary_gemv(weights: &PackedMatrix, act: &QuantizedActivations) -> Result<Vec<f32>> {
    check_len(weights, act)?;
    let shape = weights.shape();
    let mut out = Vec::with_capacity(shape.m());
    for row in 0..shape.m() {
        let mut facc = 0.0f32;
        for (b, block) in weights.row_blocks(row).iter().enumerate() {
            let a = &act.values[b * BLOCK_LEN..(b + 1) * BLOCK_LEN];
            facc += block_dot(block, a) as f32 * block.scale();
        }
        out.push(facc * act.scale);
    }
    Ok(out)
}

/// Float matmul of the dequantised weights with `x`, through candle.
///
/// Not bit-exact with [`ternary_gemv`]; used as an independent sanity check
/// of the codec and the activation path.
pub fn dequant_matvec(weights: &PackedMatrix, x: &[f32]) -> Result<Vec<f32>> {
    let shape = weights.shape();
    if x.len() != shape.k() {
        return Err(TuneError::InvalidShape {
            m: shape.m(),
            k: shape.k(),
            reason: format!("input vector has {} elements", x.len()),
        });
    }
    let device = Device::Cpu;
    let tensor = |e: candle_core::Error| TuneError::Tensor(e.to_string());
    let w = weights.to_tensor(&device)?;
    let xv = Tensor::from_slice(x, (shape.k(), 1), &device).map_err(tensor)?;
    w.matmul(&xv)
        .and_then(|y| y.flatten_all())
        .and_then(|y| y.to_vec1::<f32>())
        .map_err(tensor)
}

// ── Tests ───────────────────────────────────────────────────────────────────
